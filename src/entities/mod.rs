pub mod medicine;
pub mod order;
pub mod order_item;
pub mod pharmacy;

pub use order::OrderStatus;
