// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Provision
//!
//! A declarative, idempotent infrastructure reconciliation engine.
//!
//! ## Overview
//!
//! Halldyll reads a desired-state document listing resources and the
//! references between them, compares it with the recorded actual state and
//! converges the two through provider plugins:
//!
//! - Build a dependency graph from `${kind.name.attribute}` references and
//!   explicit `depends_on` edges
//! - Diff it against recorded state into create, update, replace, destroy
//!   and no-op actions
//! - Order the resulting provider calls into batches
//! - Execute each batch concurrently, skipping the dependents of failures
//! - Persist every confirmed operation before moving on
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `halldyll.infra.yaml`
//! 2. **Actual State**: Recorded by the [`state::StateStore`]
//! 3. **Reconciler**: Plans and executes the calls that close the gap
//!
//! ## Modules
//!
//! - [`config`]: Document parsing and validation
//! - [`graph`]: Resource graph construction
//! - [`state`]: State storage backends (local, S3)
//! - [`provider`]: Provider interface and the HTTP plugin
//! - [`planner`]: Diff computation, plan batching and execution
//! - [`reconciler`]: Plan, apply, refresh and drift entry points
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! providers:
//!   - name: cloud
//!     endpoint: http://localhost:8080
//!     token_env: HALLDYLL_CLOUD_TOKEN
//!
//! resources:
//!   - type: network
//!     name: main
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - type: instance
//!     name: web
//!     attributes:
//!       network_id: ${network.main.id}
//!
//! outputs:
//!   web_ip: ${instance.web.public_ip}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, InfraConfig};
pub use error::{HalldyllError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{DiffEngine, ExecutionPlan, PlanExecutor, Planner};
pub use provider::{HttpProvider, Provider, ProviderRegistry};
pub use reconciler::{ApplyResult, DriftReport, PlanMode, Reconciler};
pub use state::{LocalStateBackend, S3StateBackend, StateBackend, StateStore};
