//! Stock counts and the per-variant intake stream.

mod stock;
mod stock_item;

pub use stock::{ProductStock, StockError};
pub use stock_item::{StockEvent, StockItem, StockReceivedData};
