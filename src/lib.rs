//! Dependency analysis and test orchestration for reconciliation templates
//! hosted on a bookkeeping platform.
//!
//! The engine does three things: it statically discovers what a template
//! depends on ([`scan`]), synthesizes an executable test fixture from those
//! dependencies plus live company data ([`fixture`]), and drives remote
//! test/preview runs to completion with line-accurate diagnostics
//! ([`index`], [`run`]). Local storage and the remote platform are
//! collaborators behind the seams in [`store`] and [`remote`]; [`http`] is
//! the stock adapter for the latter.

pub mod fixture;
pub mod http;
pub mod index;
pub mod remote;
pub mod run;
pub mod scan;
pub mod store;
