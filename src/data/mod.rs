/// Data layer: tables, matrices, checks and the output container.
///
/// Architecture:
/// ```text
///  .csv / .txt tables          matrix files
///        │                          │
///        ▼                          ▼
///   ┌──────────┐             ┌────────────┐
///   │  loader   │  rows →     │  assemble   │  triples / dense rows → Matrix,
///   └──────────┘  Table       └────────────┘  combine contributions
///        │                          │
///        └────────────┬─────────────┘
///                     ▼
///               ┌──────────┐
///               │  check    │  diag(total) vs uncertainty²
///               └──────────┘
///                     │
///                     ▼
///   ┌──────────┐  ┌──────────┐
///   │  linalg   │→ │ container │  named hist1d / hist2d / matrix objects
///   └──────────┘  └──────────┘  → .parquet / .json
/// ```
///
/// `flatten` turns two-dimensional grids into the one-dimensional bin
/// order the matrices are quoted in.

pub mod assemble;
pub mod check;
pub mod container;
pub mod flatten;
pub mod linalg;
pub mod loader;
pub mod model;
