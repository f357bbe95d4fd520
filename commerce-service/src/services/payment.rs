//! Settles orders through a gateway.
//!
//! Every attempt is recorded as `pending` and committed before the gateway is
//! contacted, then moved to `succeeded` or `failed` in a second session once
//! the gateway answers. A row left `pending` therefore marks an attempt whose
//! outcome is unknown and must be reconciled against the provider.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CommerceError, CommerceResult};
use crate::models::money::{normalize_currency, to_minor_units};
use crate::models::{NewPaymentTransaction, OrderStatus, PaymentStatus, PaymentTransaction};
use crate::services::gateway::{ChargeReceipt, ChargeRequest, GatewayError, GatewayRegistry};
use crate::services::metrics::{
    GATEWAY_REQUEST_DURATION, PAYMENTS_TOTAL, PAYMENT_AMOUNT_MINOR_TOTAL,
};
use crate::store::{Database, OrderStore, PaymentStore, Session, StoreError};

/// One request to settle an order.
#[derive(Debug, Clone)]
pub struct PaymentInstruction {
    pub order_id: Uuid,
    /// Major units, e.g. `25.00`.
    pub amount: Decimal,
    pub currency: String,
    pub provider: String,
    pub token: String,
    /// Client supplied; derived from the order and attempt number if absent.
    pub idempotency_key: Option<String>,
}

pub struct PaymentOrchestrator<D> {
    db: Arc<D>,
    gateways: GatewayRegistry,
    gateway_timeout: Duration,
}

impl<D> Clone for PaymentOrchestrator<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            gateways: self.gateways.clone(),
            gateway_timeout: self.gateway_timeout,
        }
    }
}

/// Terminal outcome of a gateway call, as it will be persisted.
struct Settlement {
    status: PaymentStatus,
    provider_tx_id: Option<String>,
    failure_message: Option<String>,
}

impl Settlement {
    fn from_gateway(result: Result<ChargeReceipt, GatewayError>) -> Self {
        match result {
            Ok(receipt) if receipt.is_succeeded() => Settlement {
                status: PaymentStatus::Succeeded,
                provider_tx_id: Some(receipt.provider_tx_id),
                failure_message: None,
            },
            // Accepted but unconfirmed: the provider reference is kept so a
            // later attempt re-presents the same charge instead of a new one.
            Ok(receipt) => Settlement {
                status: PaymentStatus::Failed,
                failure_message: Some(format!(
                    "gateway reported status '{}' for {}",
                    receipt.status, receipt.provider_tx_id
                )),
                provider_tx_id: Some(receipt.provider_tx_id),
            },
            Err(err) => Settlement {
                status: PaymentStatus::Failed,
                provider_tx_id: None,
                failure_message: Some(err.to_string()),
            },
        }
    }
}

/// Settlement writes are retried this many times before the attempt is left
/// `pending` for a later call to resume.
const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_BACKOFF: Duration = Duration::from_millis(25);

fn replay(existing: PaymentTransaction) -> CommerceResult<PaymentTransaction> {
    match existing.status {
        PaymentStatus::Succeeded => Ok(existing),
        PaymentStatus::Failed => Err(CommerceError::PaymentFailed(
            existing
                .failure_message
                .unwrap_or_else(|| "payment failed".to_string()),
        )),
        PaymentStatus::Pending => Err(CommerceError::Conflict(format!(
            "payment attempt '{}' is still in progress",
            existing.idempotency_key
        ))),
    }
}

/// Key presented to the gateway. An earlier attempt the provider accepted
/// but never confirmed lends its key, so the provider deduplicates.
fn gateway_key(attempts: &[PaymentTransaction], current: &PaymentTransaction) -> String {
    attempts
        .iter()
        .rev()
        .find(|a| {
            a.id != current.id && a.status == PaymentStatus::Failed && a.provider_tx_id.is_some()
        })
        .map(|a| a.idempotency_key.clone())
        .unwrap_or_else(|| current.idempotency_key.clone())
}

impl<D: Database> PaymentOrchestrator<D> {
    pub fn new(db: Arc<D>, gateways: GatewayRegistry, gateway_timeout: Duration) -> Self {
        Self {
            db,
            gateways,
            gateway_timeout,
        }
    }

    /// A live attempt settles within the gateway timeout plus the settlement
    /// retries; a `pending` row older than this was abandoned.
    fn stale_after(&self) -> Duration {
        self.gateway_timeout * 2 + SETTLE_BACKOFF * SETTLE_ATTEMPTS * SETTLE_ATTEMPTS
    }

    fn is_stale(&self, tx: &PaymentTransaction) -> bool {
        let age = chrono::Utc::now().signed_duration_since(tx.updated_at);
        age.to_std().map(|age| age > self.stale_after()).unwrap_or(false)
    }

    /// Charges the instruction's amount against its order.
    ///
    /// Returns the terminal record on success and `PaymentFailed` when the
    /// gateway declines or errors. A repeated idempotency key returns the
    /// earlier outcome without contacting the gateway again. An abandoned
    /// `pending` attempt for the order is resumed with its own key and
    /// settled instead of a new attempt being opened.
    #[instrument(
        skip(self, instruction),
        fields(order_id = %instruction.order_id, provider = %instruction.provider)
    )]
    pub async fn process_payment(
        &self,
        instruction: PaymentInstruction,
    ) -> CommerceResult<PaymentTransaction> {
        let currency = normalize_currency(&instruction.currency)?;
        to_minor_units(instruction.amount, &currency)?;
        if instruction.token.trim().is_empty() {
            return Err(CommerceError::InvalidInput(
                "payment token is required".to_string(),
            ));
        }
        if self.gateways.get(&instruction.provider).is_none() {
            return Err(CommerceError::InvalidInput(format!(
                "unknown payment provider '{}'",
                instruction.provider
            )));
        }

        let (pending, gateway_key) = match self.record_intent(&instruction, &currency).await? {
            Intent::Charge { tx, gateway_key } => (tx, gateway_key),
            Intent::Replayed(tx) => return replay(tx),
        };

        // The row, not the instruction, is authoritative: a resumed attempt
        // charges exactly what it recorded.
        let gateway = self.gateways.get(&pending.provider).ok_or_else(|| {
            CommerceError::InvalidInput(format!(
                "unknown payment provider '{}'",
                pending.provider
            ))
        })?;
        let amount_minor = to_minor_units(pending.amount, &pending.currency)?;

        info!(
            payment_id = %pending.id,
            idempotency_key = %pending.idempotency_key,
            gateway_key = %gateway_key,
            amount_minor = amount_minor,
            "Payment intent recorded"
        );

        let request = ChargeRequest {
            amount_minor,
            currency: pending.currency.clone(),
            token: pending.token.clone(),
            idempotency_key: gateway_key,
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.gateway_timeout, gateway.charge(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.gateway_timeout)),
        };
        GATEWAY_REQUEST_DURATION
            .with_label_values(&[gateway.name()])
            .observe(started.elapsed().as_secs_f64());

        let settlement = Settlement::from_gateway(outcome);
        let settled = self.settle_with_retry(&pending, &settlement).await?;

        PAYMENTS_TOTAL
            .with_label_values(&[settled.provider.as_str(), settled.status.as_str()])
            .inc();

        match settled.status {
            PaymentStatus::Succeeded => {
                PAYMENT_AMOUNT_MINOR_TOTAL
                    .with_label_values(&[settled.currency.as_str()])
                    .inc_by(amount_minor.unsigned_abs());
                info!(
                    payment_id = %settled.id,
                    provider_tx_id = ?settled.provider_tx_id,
                    "Payment succeeded"
                );
                Ok(settled)
            }
            _ => {
                let message = settled
                    .failure_message
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string());
                warn!(payment_id = %settled.id, reason = %message, "Payment failed");
                Err(CommerceError::PaymentFailed(message))
            }
        }
    }

    /// Session A: validate the order and durably record a `pending` attempt,
    /// or pick up an abandoned one.
    async fn record_intent(
        &self,
        instruction: &PaymentInstruction,
        currency: &str,
    ) -> CommerceResult<Intent> {
        let mut session = self.db.begin().await?;

        let order = session
            .lock_order(instruction.order_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("order {}", instruction.order_id)))?;

        let attempts = session.list_by_order(order.id).await?;

        if let Some(key) = instruction.idempotency_key.as_deref() {
            if let Some(existing) = session.find_by_idempotency_key(key).await? {
                if existing.order_id != order.id {
                    return Err(CommerceError::Conflict(format!(
                        "idempotency key '{}' belongs to another order",
                        key
                    )));
                }
                if existing.status == PaymentStatus::Pending && self.is_stale(&existing) {
                    warn!(payment_id = %existing.id, "Resuming abandoned payment attempt");
                    let gateway_key = gateway_key(&attempts, &existing);
                    return Ok(Intent::Charge {
                        tx: existing,
                        gateway_key,
                    });
                }
                return Ok(Intent::Replayed(existing));
            }
        }

        if order.status == OrderStatus::Paid {
            return Err(CommerceError::Conflict(format!(
                "order {} is already paid",
                order.id
            )));
        }

        if let Some(open) = attempts.iter().find(|a| a.status == PaymentStatus::Pending) {
            if !self.is_stale(open) {
                return Err(CommerceError::Conflict(format!(
                    "order {} has a payment in progress",
                    order.id
                )));
            }
            warn!(payment_id = %open.id, "Resuming abandoned payment attempt");
            return Ok(Intent::Charge {
                tx: open.clone(),
                gateway_key: gateway_key(&attempts, open),
            });
        }

        let idempotency_key = instruction
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("order:{}:attempt:{}", order.id, attempts.len() + 1));

        let pending = session
            .create(&NewPaymentTransaction {
                order_id: order.id,
                amount: instruction.amount,
                currency: currency.to_string(),
                provider: instruction.provider.clone(),
                token: instruction.token.clone(),
                idempotency_key,
            })
            .await?;

        session.commit().await?;
        Ok(Intent::Charge {
            gateway_key: gateway_key(&attempts, &pending),
            tx: pending,
        })
    }

    /// Retries transient store failures so the attempt does not stay
    /// `pending` after the gateway answered.
    async fn settle_with_retry(
        &self,
        pending: &PaymentTransaction,
        settlement: &Settlement,
    ) -> CommerceResult<PaymentTransaction> {
        let mut attempt = 1;
        loop {
            match self.settle(pending, settlement).await {
                Ok(settled) => return Ok(settled),
                // Someone else settled it; report what they stored.
                Err(CommerceError::Store(StoreError::Conflict(_))) => {
                    let mut session = self.db.begin().await?;
                    return match session.find_by_idempotency_key(&pending.idempotency_key).await? {
                        Some(current) if current.status.is_terminal() => Ok(current),
                        _ => Err(CommerceError::Conflict(format!(
                            "payment {} changed during settlement",
                            pending.id
                        ))),
                    };
                }
                Err(e) if attempt < SETTLE_ATTEMPTS => {
                    warn!(
                        payment_id = %pending.id,
                        attempt = attempt,
                        error = %e,
                        "Settlement write failed, retrying"
                    );
                    tokio::time::sleep(SETTLE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        payment_id = %pending.id,
                        error = %e,
                        "Failed to persist gateway outcome; attempt left pending for resumption"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Session B: move the attempt to its terminal status.
    async fn settle(
        &self,
        pending: &PaymentTransaction,
        settlement: &Settlement,
    ) -> CommerceResult<PaymentTransaction> {
        let mut session = self.db.begin().await?;

        let settled = session
            .update_status(
                pending.id,
                settlement.status,
                settlement.provider_tx_id.as_deref(),
                settlement.failure_message.as_deref(),
            )
            .await?;

        if settled.status == PaymentStatus::Succeeded {
            session
                .update_order_status(pending.order_id, OrderStatus::Paid)
                .await?;
        }

        session.commit().await?;
        Ok(settled)
    }

    /// Latest attempt for the order.
    pub async fn get_payment_by_order(&self, order_id: Uuid) -> CommerceResult<PaymentTransaction> {
        let mut session = self.db.begin().await?;
        session
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("payment for order {}", order_id)))
    }

    /// Every attempt for the order, oldest first.
    pub async fn list_payments_for_order(
        &self,
        order_id: Uuid,
    ) -> CommerceResult<Vec<PaymentTransaction>> {
        let mut session = self.db.begin().await?;
        if session.find_order_by_id(order_id).await?.is_none() {
            return Err(CommerceError::not_found(format!("order {}", order_id)));
        }
        Ok(session.list_by_order(order_id).await?)
    }
}

enum Intent {
    /// Charge this `pending` row, presenting `gateway_key` to the provider.
    Charge {
        tx: PaymentTransaction,
        gateway_key: String,
    },
    Replayed(PaymentTransaction),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Order;
    use crate::services::gateway::{SettlementGateway, SimulatedGateway};
    use crate::services::{CartManager, CheckoutOrchestrator};
    use crate::store::MemoryDatabase;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Outcome = fn() -> Result<ChargeReceipt, GatewayError>;

    /// Answers with queued outcomes, then with `result`, and records the keys
    /// it was sent. Checks that the pending row is already committed when a
    /// fresh key arrives.
    struct ScriptedGateway {
        db: MemoryDatabase,
        result: Outcome,
        queued: Mutex<VecDeque<Outcome>>,
        keys: Mutex<Vec<String>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn then(&self, outcome: Outcome) {
            self.queued.lock().unwrap().push_back(outcome);
        }

        fn keys(&self) -> Vec<String> {
            self.keys.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SettlementGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut session = self.db.begin().await.unwrap();
            let recorded = session
                .find_by_idempotency_key(&request.idempotency_key)
                .await
                .unwrap()
                .expect("intent must be committed before the gateway is called");
            drop(session);

            let fresh = {
                let mut keys = self.keys.lock().unwrap();
                let fresh = !keys.contains(&request.idempotency_key);
                keys.push(request.idempotency_key.clone());
                fresh
            };
            if fresh {
                assert_eq!(recorded.status, PaymentStatus::Pending);
            }

            tokio::time::sleep(self.delay).await;
            let outcome = self.queued.lock().unwrap().pop_front().unwrap_or(self.result);
            outcome()
        }
    }

    struct Fixture {
        db: MemoryDatabase,
        payments: PaymentOrchestrator<MemoryDatabase>,
        checkout: CheckoutOrchestrator<MemoryDatabase>,
        gateway: Arc<ScriptedGateway>,
    }

    fn fixture(result: Outcome, delay: Duration) -> Fixture {
        let db = MemoryDatabase::new();
        let shared = Arc::new(db.clone());
        let gateway = Arc::new(ScriptedGateway {
            db: db.clone(),
            result,
            queued: Mutex::new(VecDeque::new()),
            keys: Mutex::new(Vec::new()),
            delay,
            calls: AtomicUsize::new(0),
        });
        let registry = GatewayRegistry::new()
            .with(gateway.clone())
            .with(Arc::new(SimulatedGateway));
        Fixture {
            payments: PaymentOrchestrator::new(shared.clone(), registry, Duration::from_millis(200)),
            checkout: CheckoutOrchestrator::new(shared),
            db,
            gateway,
        }
    }

    fn approve() -> Result<ChargeReceipt, GatewayError> {
        Ok(ChargeReceipt {
            provider_tx_id: "ch_approved".to_string(),
            status: "succeeded".to_string(),
        })
    }

    fn decline() -> Result<ChargeReceipt, GatewayError> {
        Err(GatewayError::Declined {
            code: "card_declined".to_string(),
            message: "Your card was declined.".to_string(),
        })
    }

    fn still_processing() -> Result<ChargeReceipt, GatewayError> {
        Ok(ChargeReceipt {
            provider_tx_id: "ch_slow".to_string(),
            status: "pending".to_string(),
        })
    }

    async fn order(f: &Fixture) -> Order {
        let user_id = Uuid::new_v4();
        let carts = CartManager::new(Arc::new(f.db.clone()));
        carts
            .add_item(user_id, Uuid::new_v4(), 2, Decimal::new(1000, 2))
            .await
            .unwrap();
        carts
            .add_item(user_id, Uuid::new_v4(), 1, Decimal::new(500, 2))
            .await
            .unwrap();
        f.checkout.create_order(user_id).await.unwrap()
    }

    fn instruction(order: &Order, provider: &str) -> PaymentInstruction {
        PaymentInstruction {
            order_id: order.id,
            amount: order.total,
            currency: "USD".to_string(),
            provider: provider.to_string(),
            token: "tok_visa".to_string(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn success_records_provider_reference_and_marks_order_paid() {
        let f = fixture(approve, Duration::ZERO);
        let order = order(&f).await;

        let tx = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap();

        assert_eq!(tx.status, PaymentStatus::Succeeded);
        assert_eq!(tx.provider_tx_id.as_deref(), Some("ch_approved"));
        assert_eq!(tx.failure_message, None);
        assert_eq!(tx.currency, "usd");
        assert_eq!(tx.amount, Decimal::new(2500, 2));
        assert_eq!(tx.idempotency_key, format!("order:{}:attempt:1", order.id));
        assert_eq!(
            f.checkout.get_order_by_id(order.id).await.unwrap().status,
            OrderStatus::Paid
        );
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn decline_is_recorded_as_failed() {
        let f = fixture(decline, Duration::ZERO);
        let order = order(&f).await;

        let err = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::PaymentFailed(ref m) if m.contains("declined")));

        let tx = f.payments.get_payment_by_order(order.id).await.unwrap();
        assert_eq!(tx.status, PaymentStatus::Failed);
        assert!(tx.provider_tx_id.is_none());
        assert!(!tx.failure_message.unwrap_or_default().is_empty());
        assert_eq!(
            f.checkout.get_order_by_id(order.id).await.unwrap().status,
            OrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn non_succeeded_gateway_status_is_a_failure() {
        let f = fixture(still_processing, Duration::ZERO);
        let order = order(&f).await;

        let err = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::PaymentFailed(_)));
        let tx = f.payments.get_payment_by_order(order.id).await.unwrap();
        assert_eq!(tx.status, PaymentStatus::Failed);
        assert_eq!(tx.provider_tx_id.as_deref(), Some("ch_slow"));
    }

    #[tokio::test]
    async fn retry_after_unconfirmed_charge_reuses_its_gateway_key() {
        let f = fixture(approve, Duration::ZERO);
        f.gateway.then(still_processing);
        let order = order(&f).await;

        assert!(f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .is_err());
        let tx = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap();

        let first_key = format!("order:{}:attempt:1", order.id);
        assert_eq!(tx.idempotency_key, format!("order:{}:attempt:2", order.id));
        assert_eq!(f.gateway.keys(), vec![first_key.clone(), first_key]);
        assert_eq!(tx.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn transient_settlement_failure_is_retried() {
        let f = fixture(approve, Duration::ZERO);
        let order = order(&f).await;
        f.db.fail_next("update_payment_status");

        let tx = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap();

        assert_eq!(tx.status, PaymentStatus::Succeeded);
        assert_eq!(
            f.payments.get_payment_by_order(order.id).await.unwrap().status,
            PaymentStatus::Succeeded
        );
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_attempt_is_resumed_with_its_own_key() {
        let f = fixture(approve, Duration::ZERO);
        let order = order(&f).await;
        f.db.fail_times("update_payment_status", SETTLE_ATTEMPTS as usize);

        assert!(f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .is_err());
        let stranded = f.payments.get_payment_by_order(order.id).await.unwrap();
        assert_eq!(stranded.status, PaymentStatus::Pending);

        // Still within the window a live attempt could need.
        assert!(matches!(
            f.payments
                .process_payment(instruction(&order, "scripted"))
                .await,
            Err(CommerceError::Conflict(_))
        ));

        tokio::time::sleep(f.payments.stale_after() + Duration::from_millis(50)).await;
        let resumed = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap();

        assert_eq!(resumed.id, stranded.id);
        assert_eq!(resumed.status, PaymentStatus::Succeeded);
        assert_eq!(f.gateway.keys(), vec![stranded.idempotency_key.clone(); 2]);
        assert_eq!(f.payments.list_payments_for_order(order.id).await.unwrap().len(), 1);
        assert_eq!(
            f.checkout.get_order_by_id(order.id).await.unwrap().status,
            OrderStatus::Paid
        );
    }

    #[tokio::test]
    async fn gateway_timeout_is_recorded_as_failed() {
        let f = fixture(approve, Duration::from_secs(5));
        let order = order(&f).await;

        let err = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::PaymentFailed(ref m) if m.contains("did not answer")));
        assert_eq!(
            f.payments.get_payment_by_order(order.id).await.unwrap().status,
            PaymentStatus::Failed
        );
    }

    #[tokio::test]
    async fn failed_attempt_can_be_followed_by_a_new_one() {
        let f = fixture(decline, Duration::ZERO);
        let order = order(&f).await;

        assert!(f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .is_err());
        let tx = f
            .payments
            .process_payment(instruction(&order, "simulated"))
            .await
            .unwrap();

        assert_eq!(tx.idempotency_key, format!("order:{}:attempt:2", order.id));
        let attempts = f.payments.list_payments_for_order(order.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, PaymentStatus::Failed);
        assert_eq!(attempts[1].status, PaymentStatus::Succeeded);
        assert_eq!(
            f.payments.get_payment_by_order(order.id).await.unwrap().id,
            tx.id
        );
    }

    #[tokio::test]
    async fn repeated_idempotency_key_does_not_charge_twice() {
        let f = fixture(approve, Duration::ZERO);
        let order = order(&f).await;
        let mut request = instruction(&order, "scripted");
        request.idempotency_key = Some("client-key-1".to_string());

        let first = f.payments.process_payment(request.clone()).await.unwrap();
        let second = f.payments.process_payment(request).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.payments.list_payments_for_order(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn paid_order_rejects_new_attempts() {
        let f = fixture(approve, Duration::ZERO);
        let order = order(&f).await;
        f.payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap();

        let err = f
            .payments
            .process_payment(instruction(&order, "scripted"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::Conflict(_)));
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_attempts_on_one_order_charge_once() {
        let f = fixture(approve, Duration::from_millis(50));
        let order = order(&f).await;

        let (a, b) = tokio::join!(
            f.payments.process_payment(instruction(&order, "scripted")),
            f.payments.process_payment(instruction(&order, "scripted")),
        );

        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        assert!([&a, &b]
            .iter()
            .any(|r| matches!(r, Err(CommerceError::Conflict(_)))));
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_instructions_are_rejected_before_recording() {
        let f = fixture(approve, Duration::ZERO);
        let order = order(&f).await;

        let unknown_provider = instruction(&order, "paypal");
        let mut fractional = instruction(&order, "scripted");
        fractional.amount = Decimal::new(10001, 3);
        let mut no_token = instruction(&order, "scripted");
        no_token.token = " ".to_string();

        for bad in [unknown_provider, fractional, no_token] {
            let err = f.payments.process_payment(bad).await.unwrap_err();
            assert!(matches!(err, CommerceError::InvalidInput(_)));
        }
        assert!(f.payments.list_payments_for_order(order.id).await.unwrap().is_empty());
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_order_and_missing_payment_are_not_found() {
        let f = fixture(approve, Duration::ZERO);

        let missing = PaymentInstruction {
            order_id: Uuid::new_v4(),
            amount: Decimal::new(100, 2),
            currency: "usd".to_string(),
            provider: "scripted".to_string(),
            token: "tok_visa".to_string(),
            idempotency_key: None,
        };
        assert!(matches!(
            f.payments.process_payment(missing).await,
            Err(CommerceError::NotFound(_))
        ));

        let order = order(&f).await;
        assert!(matches!(
            f.payments.get_payment_by_order(order.id).await,
            Err(CommerceError::NotFound(_))
        ));
    }
}
