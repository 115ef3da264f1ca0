//! Scenario-based tests for release-pipeline

mod helpers;

mod deployment;
mod end_to_end;
mod failure_handling;
mod success_chain;
mod variable_propagation;
