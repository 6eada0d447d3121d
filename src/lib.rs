//! Converts published cross-section tables and their covariance matrices
//! into a container of named histograms and matrices.
//!
//! ```text
//! table parser → matrix assembler → consistency checker → serializer
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
