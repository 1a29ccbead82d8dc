//! Process Core Tests
//!
//! Scenario tests driving the scheduler on a host machine.

mod host;
