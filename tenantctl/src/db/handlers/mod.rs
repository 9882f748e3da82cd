//! Repository implementations for database access.
//!
//! Each repository wraps a borrowed `&mut PgConnection`, so it works equally on a pooled
//! connection or inside a caller's transaction:
//!
//! ```ignore
//! use tenantctl::db::handlers::Bills;
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let mut bills = Bills::new(&mut tx);
//!     let candidates = bills.list_eligible(user_id, None, amount, chrono::Utc::now()).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Available Repositories
//!
//! - [`Users`]: Caller access and billing group memberships
//! - [`Policies`]: Model policies, credential groups and credential bindings (read-only)
//! - [`Bills`]: Subscription quota records and their conditional deduction
//! - [`PrepaidCards`]: Prepaid balances and their conditional deduction
//! - [`QuotaDeductions`]: Deduction ledger

pub mod bills;
pub mod policies;
pub mod prepaid_cards;
pub mod quota_deductions;
pub mod users;

pub use bills::Bills;
pub use policies::Policies;
pub use prepaid_cards::PrepaidCards;
pub use quota_deductions::QuotaDeductions;
pub use users::Users;
