//! Testing infrastructure for converge.
//!
//! This module provides mocks and fixtures for testing the orchestrator and
//! its components without real providers or environment instances.
//!
//! # Architecture
//!
//! - **Mocks**: Test doubles for the proposer, judge, gateway and launcher
//!   traits with scripted behaviour
//! - **Fixtures**: Pre-built attempt configurations and tasks
//!
//! # Example
//!
//! ```rust,ignore
//! use converge::testing::{MockGateway, ScriptedJudge, ScriptedProposer};
//!
//! let judge = ScriptedJudge::new().with_scores(&[0.2, 0.5, 0.9]);
//! let gateway = MockGateway::new().with_rejections(1);
//! ```

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
