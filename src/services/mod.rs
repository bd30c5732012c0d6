pub mod fulfillment;
pub mod orders;
pub mod reconciliation;
pub mod stock;
