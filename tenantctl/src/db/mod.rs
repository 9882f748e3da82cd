//! Database layer for data persistence and access.
//!
//! This module implements the data access layer using SQLx with PostgreSQL.
//!
//! # Modules
//!
//! - [`handlers`]: Repository implementations
//! - [`models`]: Database record structures matching table schemas
//! - [`errors`]: Database-specific error types
//!
//! # Transactions
//!
//! Repositories borrow a connection rather than owning a pool. Anything that mutates balances
//! must run on a transaction the caller opened, so that a failed or cancelled request rolls
//! back every write it made:
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! let outcome = engine.deduct(&mut tx, user_id, group_id, amount, cost_micros).await?;
//! if outcome.deducted() {
//!     tx.commit().await?;
//! }
//! // dropping `tx` without commit rolls back
//! ```
//!
//! # Migrations
//!
//! Migrations live in `migrations/` and are embedded by [`crate::migrator`]:
//!
//! ```ignore
//! tenantctl::migrator().run(&pool).await?;
//! ```

pub mod errors;
pub mod handlers;
pub mod models;
