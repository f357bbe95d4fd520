pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod gateway;
pub mod metrics;
pub mod payment;
pub mod stripe;

pub use cart::CartManager;
pub use catalog::Catalog;
pub use checkout::CheckoutOrchestrator;
pub use gateway::{GatewayRegistry, SettlementGateway, SimulatedGateway};
pub use metrics::{get_metrics, init_metrics};
pub use payment::{PaymentInstruction, PaymentOrchestrator};
pub use stripe::StripeGateway;
