//! Domain models for commerce-service.

mod cart;
pub mod money;
mod order;
mod payment;
mod product;

pub use cart::{Cart, CartItem, NewCartItem};
pub use order::{NewOrder, NewOrderItem, Order, OrderItem, OrderStatus};
pub use payment::{NewPaymentTransaction, PaymentStatus, PaymentTransaction};
pub use product::{NewProduct, Product};
