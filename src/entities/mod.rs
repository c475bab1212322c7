//! Database entities for the checkout and settlement tables.

pub mod cart_item;
pub mod coupon;
pub mod coupon_usage;
pub mod order;
pub mod order_item;
pub mod product;
pub mod saved_address;
