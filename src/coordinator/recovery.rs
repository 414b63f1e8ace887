//! Restart recovery: reload open positions, absorb fills that happened
//! while the process was down, and reconcile local quantity with the
//! venue before resuming normal routing.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::engine::{PositionEvent, PositionStateMachine};
use crate::error::Result;

use super::TradeCoordinator;

impl TradeCoordinator {
    /// Rebuild in-memory state from persisted snapshots. Call after the
    /// accounts are registered and before the fill streams start.
    pub async fn recover(&self) -> Result<usize> {
        let positions = self.store.load_open_positions().await?;
        let count = positions.len();
        info!(count, "recovering open positions");

        for position in positions {
            let position_id = position.id;
            let venue = position.plan.venue;
            let account = position.plan.account.clone();
            let symbol = position.plan.symbol.clone();

            let runtime = match self.runtime(venue, &account).await {
                Ok(rt) => rt,
                Err(e) => {
                    error!(%position_id, error = %e, "no runtime for persisted position");
                    continue;
                }
            };

            for order in &position.working_orders {
                self.add_route(venue, &symbol, &order.client_key, position_id)
                    .await;
            }
            let working_keys: Vec<String> = position
                .working_orders
                .iter()
                .map(|o| o.client_key.clone())
                .collect();

            let machine = Arc::new(Mutex::new(PositionStateMachine::from_snapshot(
                position,
                self.config.policy.clone(),
            )));
            self.machines
                .write()
                .await
                .insert(position_id, machine.clone());

            let mut guard = machine.lock().await;

            // Downtime fills first: the venue's cumulative quantity per
            // order is authoritative, the machine applies the delta.
            for client_key in working_keys {
                match runtime.executor.status(&symbol, &client_key).await {
                    Ok(Some(result)) => {
                        let outcome = guard.apply(PositionEvent::OrderUpdate(result))?;
                        self.store.save_position(guard.position()).await?;
                        self.run_outcome(position_id, &mut guard, outcome).await?;
                    }
                    Ok(None) => {
                        warn!(
                            %position_id,
                            client_key,
                            "working order unknown to venue"
                        );
                    }
                    Err(e) => {
                        warn!(%position_id, client_key, error = %e, "status query failed");
                    }
                }
                if guard.position().is_terminal() {
                    break;
                }
            }

            // Then the net position itself, in case something moved it
            // outside our orders.
            if !guard.position().is_terminal() {
                match runtime.adapter.position(&symbol).await {
                    Ok(venue_position) => {
                        let local = guard.position().remaining_quantity;
                        if venue_position.quantity.abs() != local {
                            warn!(
                                %position_id,
                                local = %local,
                                venue = %venue_position.quantity,
                                "recovered position differs from venue, adopting venue quantity"
                            );
                        }
                        let outcome = guard.reconcile(venue_position.quantity)?;
                        self.store.save_position(guard.position()).await?;
                        self.run_outcome(position_id, &mut guard, outcome).await?;
                    }
                    Err(e) => {
                        error!(%position_id, error = %e, "venue position query failed");
                    }
                }
            }

            let terminal = guard.position().is_terminal();
            drop(guard);
            if terminal {
                self.retire(position_id).await;
            } else {
                info!(%position_id, symbol, "position recovered");
            }
        }
        Ok(count)
    }
}
