//! Checkout and payment settlement services.

pub mod cart;
pub mod gateway;
pub mod notifications;
pub mod orders;
pub mod pricing;
pub mod settlement;
pub mod signature;
pub mod verifier;
