//! End-to-end tests driving `Project` and `BuildEngine` against scratch
//! projects with real `/bin/sh` processes.

#![cfg(unix)]

mod common;

mod build_tests;
mod test_phase_tests;
