//! Database record models matching table schemas.
//!
//! These structs are what repositories in [`crate::db::handlers`] return. They are kept apart
//! from the domain types in [`crate::types`] so storage can evolve independently; conversions
//! go through `From` impls.
//!
//! # Model Categories
//!
//! ## Access Scoping
//!
//! - [`users`]: Caller access and billing group memberships
//! - [`policies`]: Model policies, credential groups and credential bindings
//!
//! ## Funding
//!
//! - [`bills`]: Period-bound subscription quota records
//! - [`prepaid_cards`]: Redeemed prepaid balances
//! - [`quota_deductions`]: Ledger of successful deductions

pub mod bills;
pub mod policies;
pub mod prepaid_cards;
pub mod quota_deductions;
pub mod users;
