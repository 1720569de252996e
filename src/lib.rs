//! # Zerogate (Zero-Trust Access Gateway, Authentication Core)
//!
//! `zerogate` authenticates human principals for a zero-trust access gateway
//! and drives the multi-step state machine that may require a secondary
//! factor before a session cookie is issued.
//!
//! ## Entry paths
//!
//! Three entry paths feed one engine: local password, federated single
//! sign-on callback, and hardware security key. The management and user
//! surfaces share the engine with different role parameters and post-login
//! behaviors (status codes versus redirects preserving the caller's query).
//!
//! ## Secondary challenges
//!
//! An in-progress 2FA attempt is a short-lived challenge token bound to one
//! `(user, scope)` pair. Challenges walk `pending -> in-progress ->
//! (complete | failed)` with expiry authoritative at every step; a consumed
//! or failed challenge is indistinguishable from an expired one.
//!
//! ## Audit ordering
//!
//! Every accepted or rejected login attempt is recorded before a session is
//! ever installed. Audit write failure aborts acceptance. Invalid local
//! credentials are deliberately *not* audited so the log cannot be used to
//! enumerate accounts.

pub mod api;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod cookie;
pub mod device;
pub mod factor;
pub mod federated;
pub mod principal;
pub mod secondary;
pub mod session;
pub mod tokens;
pub mod validator;
