//! Trade coordinator: validates signals into positions, routes venue
//! order updates to the owning state machine, executes the actions the
//! machines emit, and persists a snapshot after every change.

pub mod recovery;

use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::domain::{
    ExchangeKind, OrderResult, OrderStatus, Position, TradePlan, TradeSignal,
};
use crate::engine::{OrderAction, PositionCommand, PositionEvent, PositionStateMachine};
use crate::error::{Result, SigtradeError};
use crate::exchange::ExchangeAdapter;
use crate::execution::{OrderExecutor, VenueRateLimiter};
use crate::notify::{Notifier, PositionNotification};
use crate::persistence::PositionStore;
use crate::risk::RiskMonitor;

/// Fill routing key: venue order updates carry no position id, so they
/// are matched on what they do carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    venue: ExchangeKind,
    symbol: String,
    client_key: String,
}

struct AccountRuntime {
    adapter: Arc<dyn ExchangeAdapter>,
    executor: Arc<OrderExecutor>,
}

pub struct TradeCoordinator {
    config: AppConfig,
    store: Arc<dyn PositionStore>,
    notifier: Notifier,
    accounts: RwLock<HashMap<(ExchangeKind, String), Arc<AccountRuntime>>>,
    machines: RwLock<HashMap<Uuid, Arc<Mutex<PositionStateMachine>>>>,
    routes: RwLock<HashMap<RouteKey, Uuid>>,
    risk: RiskMonitor,
}

impl TradeCoordinator {
    pub fn new(config: AppConfig, store: Arc<dyn PositionStore>, notifier: Notifier) -> Self {
        let risk = RiskMonitor::new(config.risk.clone());
        Self {
            config,
            store,
            notifier,
            accounts: RwLock::new(HashMap::new()),
            machines: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            risk,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Register a venue account. One rate limiter is shared by everything
    /// this account does on the venue.
    pub async fn register_account(
        &self,
        venue: ExchangeKind,
        account: &str,
        adapter: Arc<dyn ExchangeAdapter>,
        min_request_interval_ms: u64,
    ) {
        let limiter = Arc::new(VenueRateLimiter::from_millis(min_request_interval_ms));
        let executor = Arc::new(OrderExecutor::new(
            adapter.clone(),
            limiter,
            self.config.execution.clone(),
        ));
        self.accounts.write().await.insert(
            (venue, account.to_string()),
            Arc::new(AccountRuntime { adapter, executor }),
        );
        info!(venue = %venue, account, "account registered");
    }

    async fn runtime(&self, venue: ExchangeKind, account: &str) -> Result<Arc<AccountRuntime>> {
        self.accounts
            .read()
            .await
            .get(&(venue, account.to_string()))
            .cloned()
            .ok_or_else(|| {
                SigtradeError::internal(format!("no account registered for {}/{}", venue, account))
            })
    }

    /// Validate a signal, create the position, and place its entry
    /// orders. Malformed signals are rejected before anything reaches a
    /// venue.
    pub async fn submit_signal(&self, signal: &TradeSignal) -> Result<Uuid> {
        let plan = TradePlan::from_signal(signal, &self.config.policy)?;
        let runtime = self.runtime(plan.venue, &plan.account).await?;

        match runtime
            .adapter
            .set_leverage(&plan.symbol, plan.leverage)
            .await
        {
            Ok(effective) if effective != plan.leverage => {
                warn!(
                    symbol = %plan.symbol,
                    requested = plan.leverage,
                    effective,
                    "venue clamped leverage"
                );
            }
            Ok(_) => {}
            Err(SigtradeError::Unsupported { .. }) => {}
            Err(e) => warn!(symbol = %plan.symbol, error = %e, "failed to set leverage"),
        }

        let position_id = plan.id;
        let mut machine = PositionStateMachine::new(plan, self.config.policy.clone());
        let outcome = machine.start();
        self.store.save_position(machine.position()).await?;
        info!(
            %position_id,
            symbol = %machine.position().plan.symbol,
            "position created"
        );

        let machine = Arc::new(Mutex::new(machine));
        self.machines
            .write()
            .await
            .insert(position_id, machine.clone());

        let mut guard = machine.lock().await;
        self.run_outcome(position_id, &mut guard, outcome).await?;
        let terminal = guard.position().is_terminal();
        drop(guard);
        if terminal {
            self.retire(position_id).await;
        }
        Ok(position_id)
    }

    /// Route one venue order update to the owning position.
    pub async fn handle_order_update(&self, result: OrderResult) {
        let key = RouteKey {
            venue: result.venue,
            symbol: result.symbol.clone(),
            client_key: result.client_key.clone(),
        };
        let position_id = match self.routes.read().await.get(&key) {
            Some(id) => *id,
            None => {
                debug!(client_key = %result.client_key, "order update with no route, ignoring");
                return;
            }
        };
        if let Err(e) = self
            .apply_event(position_id, PositionEvent::OrderUpdate(result))
            .await
        {
            error!(%position_id, error = %e, "failed to apply order update");
        }
    }

    pub async fn close_position(&self, position_id: Uuid) -> Result<()> {
        self.apply_event(position_id, PositionEvent::Command(PositionCommand::Close))
            .await
    }

    pub async fn adjust_stop_loss(&self, position_id: Uuid, price: Decimal) -> Result<()> {
        self.apply_event(
            position_id,
            PositionEvent::Command(PositionCommand::AdjustStopLoss(price)),
        )
        .await
    }

    pub async fn pause_position(&self, position_id: Uuid) -> Result<()> {
        self.apply_event(position_id, PositionEvent::Command(PositionCommand::Pause))
            .await
    }

    pub async fn resume_position(&self, position_id: Uuid) -> Result<()> {
        self.apply_event(position_id, PositionEvent::Command(PositionCommand::Resume))
            .await
    }

    pub async fn position_snapshot(&self, position_id: Uuid) -> Option<Position> {
        let machine = self.machines.read().await.get(&position_id).cloned()?;
        let guard = machine.lock().await;
        Some(guard.position().clone())
    }

    pub async fn open_position_ids(&self) -> Vec<Uuid> {
        self.machines.read().await.keys().copied().collect()
    }

    /// Apply one event under the position's lock. Events for the same
    /// position serialize here; different positions proceed in parallel.
    async fn apply_event(&self, position_id: Uuid, event: PositionEvent) -> Result<()> {
        let machine = self
            .machines
            .read()
            .await
            .get(&position_id)
            .cloned()
            .ok_or_else(|| SigtradeError::PositionNotFound(position_id.to_string()))?;

        let mut guard = machine.lock().await;
        let outcome = guard.apply(event)?;
        self.store.save_position(guard.position()).await?;
        self.run_outcome(position_id, &mut guard, outcome).await?;

        if guard.position().is_terminal() {
            drop(guard);
            self.retire(position_id).await;
        }
        Ok(())
    }

    /// Execute a machine outcome: submit placements, cancels, sequenced
    /// stop replacements, and reconciliation queries. Venue results feed
    /// straight back into the machine, and the snapshot is persisted
    /// after every application.
    async fn run_outcome(
        &self,
        position_id: Uuid,
        machine: &mut PositionStateMachine,
        outcome: crate::engine::Outcome,
    ) -> Result<()> {
        let position = machine.position();
        let venue = position.plan.venue;
        let account = position.plan.account.clone();
        let symbol = position.plan.symbol.clone();
        let runtime = self.runtime(venue, &account).await?;

        self.publish(position_id, &symbol, outcome.notifications)
            .await;
        let mut actions: VecDeque<OrderAction> = outcome.actions.into();

        while let Some(action) = actions.pop_front() {
            match action {
                OrderAction::Place(intent) => {
                    self.add_route(venue, &symbol, &intent.client_key, position_id)
                        .await;
                    match runtime.executor.submit(&intent).await {
                        Ok(result) => {
                            let next = machine.apply(PositionEvent::OrderUpdate(result))?;
                            self.publish(position_id, &symbol, next.notifications).await;
                            actions.extend(next.actions);
                        }
                        Err(e) => {
                            warn!(
                                %position_id,
                                client_key = %intent.client_key,
                                error = %e,
                                "order placement failed"
                            );
                            let rejected = rejection_result(&intent.client_key, venue, &symbol, &e);
                            let next = machine.apply(PositionEvent::OrderUpdate(rejected))?;
                            self.publish(position_id, &symbol, next.notifications).await;
                            actions.extend(next.actions);
                        }
                    }
                }
                OrderAction::Cancel(cancel) => {
                    if let Err(e) = runtime
                        .executor
                        .cancel(&cancel.symbol, &cancel.client_key)
                        .await
                    {
                        warn!(
                            %position_id,
                            client_key = %cancel.client_key,
                            error = %e,
                            "cancel failed"
                        );
                    }
                }
                OrderAction::ReplaceStopLoss { cancel, place } => {
                    // The cancel must settle before the new stop goes in,
                    // or two stops could be live at once.
                    if let Some(cancel) = cancel {
                        match runtime
                            .executor
                            .cancel(&cancel.symbol, &cancel.client_key)
                            .await
                        {
                            Ok(_) => {}
                            Err(e) => {
                                error!(
                                    %position_id,
                                    client_key = %cancel.client_key,
                                    error = %e,
                                    "stop cancel failed, skipping replacement"
                                );
                                actions.push_back(OrderAction::Reconcile);
                                continue;
                            }
                        }
                    }
                    actions.push_front(OrderAction::Place(place));
                }
                OrderAction::Reconcile => {
                    match runtime.adapter.position(&symbol).await {
                        Ok(venue_position) => {
                            warn!(
                                %position_id,
                                venue_qty = %venue_position.quantity,
                                "reconciling position with venue"
                            );
                            let next = machine.reconcile(venue_position.quantity)?;
                            self.publish(position_id, &symbol, next.notifications).await;
                            actions.extend(next.actions);
                        }
                        Err(e) => {
                            error!(%position_id, error = %e, "reconciliation query failed");
                        }
                    }
                }
            }
            self.store.save_position(machine.position()).await?;
        }
        Ok(())
    }

    async fn add_route(
        &self,
        venue: ExchangeKind,
        symbol: &str,
        client_key: &str,
        position_id: Uuid,
    ) {
        self.routes.write().await.insert(
            RouteKey {
                venue,
                symbol: symbol.to_string(),
                client_key: client_key.to_string(),
            },
            position_id,
        );
    }

    async fn publish(
        &self,
        position_id: Uuid,
        symbol: &str,
        notifications: Vec<crate::notify::NotificationKind>,
    ) {
        for kind in notifications {
            self.notifier
                .publish(PositionNotification::new(position_id, symbol, kind));
        }
    }

    /// Drop in-memory state for a settled position. Its routes go too;
    /// late venue updates then fall into the no-route path.
    async fn retire(&self, position_id: Uuid) {
        self.machines.write().await.remove(&position_id);
        self.routes
            .write()
            .await
            .retain(|_, id| *id != position_id);
        info!(%position_id, "position retired");
    }

    /// Long-lived fill-stream consumer for one account. Reconnects on
    /// stream end; one account failing never touches the others.
    pub fn spawn_fill_stream(self: Arc<Self>, venue: ExchangeKind, account: String) {
        let coordinator = self;
        tokio::spawn(async move {
            let mut reconnect_delay = 1u64;
            loop {
                let runtime = match coordinator.runtime(venue, &account).await {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(%venue, account, error = %e, "fill stream task stopping");
                        return;
                    }
                };
                match runtime.adapter.fill_stream().await {
                    Ok(mut stream) => {
                        use futures_util::StreamExt;
                        reconnect_delay = 1;
                        info!(%venue, account, "fill stream consuming");
                        while let Some(result) = stream.next().await {
                            coordinator.handle_order_update(result).await;
                        }
                        warn!(%venue, account, "fill stream ended, restarting");
                    }
                    Err(e) => {
                        error!(%venue, account, error = %e, "fill stream connect failed");
                    }
                }
                tokio::time::sleep(Duration::from_secs(reconnect_delay)).await;
                reconnect_delay = (reconnect_delay * 2).min(60);
            }
        });
    }

    /// Periodic risk sweep over all open positions.
    pub fn spawn_risk_task(self: Arc<Self>) {
        let coordinator = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                coordinator.config.risk.check_interval_secs,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.run_risk_check().await {
                    error!(error = %e, "risk check failed");
                }
            }
        });
    }

    pub async fn run_risk_check(&self) -> Result<()> {
        let ids = self.open_position_ids().await;
        let mut snapshots = Vec::new();
        for id in ids {
            let Some(position) = self.position_snapshot(id).await else {
                continue;
            };
            if position.remaining_quantity.is_zero() {
                continue;
            }
            let runtime = self
                .runtime(position.plan.venue, &position.plan.account)
                .await?;
            match runtime.adapter.mark_price(&position.plan.symbol).await {
                Ok(mark) => snapshots.push((position, mark)),
                Err(e) => {
                    warn!(
                        position_id = %position.id,
                        error = %e,
                        "no mark price, skipping position in risk check"
                    );
                }
            }
        }

        let report = self.risk.evaluate(&snapshots);
        debug!(
            exposure = %report.total_exposure,
            unrealized = %report.total_unrealized,
            health = ?report.health,
            "risk check"
        );
        for forced in report.forced_closes {
            warn!(
                position_id = %forced.position_id,
                unrealized = %forced.unrealized,
                reason = %forced.reason,
                "risk-forced close"
            );
            self.apply_event(
                forced.position_id,
                PositionEvent::ForcedClose {
                    reason: forced.reason.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }
}

fn rejection_result(
    client_key: &str,
    venue: ExchangeKind,
    symbol: &str,
    error: &SigtradeError,
) -> OrderResult {
    OrderResult {
        client_key: client_key.to_string(),
        venue_order_id: None,
        venue,
        symbol: symbol.to_string(),
        status: OrderStatus::Rejected,
        filled_quantity: Decimal::ZERO,
        avg_fill_price: None,
        error: Some(error.to_string()),
        timestamp: chrono::Utc::now(),
    }
}
