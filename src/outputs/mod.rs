//! Run report output.
//!
//! # Submodules
//!
//! - [`json`]: Writes the [`RunReport`](crate::pipeline::RunReport) of each run to
//!   a JSON file for operators and downstream tooling
//!
//! # Output Structure
//!
//! ```text
//! report_dir/
//! ├── 2025-05-06/
//! │   ├── run_20250506_060000_1a2b3c.json
//! │   └── run_20250506_120000_4d5e6f.json
//! ```

pub mod json;
