use std::fs;

use approx::assert_relative_eq;
use tempfile::NamedTempFile;
use xsec_convert::data::assemble::{combine, load_matrix, MatrixKind, MatrixLayout, MatrixSpec};
use xsec_convert::data::check::ConsistencyChecker;
use xsec_convert::data::loader::{load_table, read_rows, Delimiter, TableFormat, TableLayout, TableSpec};
use xsec_convert::data::model::Matrix;
use xsec_convert::error::FormatError;

/// MINERvA-style `;` export with a two-line preamble and blank lines.
const HEPDATA: &str = "\
# Table 7
# d sigma / d T_pi
T_pi [MeV];d sigma/dT [1e-42 cm2/MeV];stat;syst

35.0-55.0;1.39;0.13;0.17
55.0-75.0;2.33;0.14;0.25

75.0-100.0;2.73;0.13;0.27
100.0-150.0;2.19;0.08;0.21
";

fn temp_file(text: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    fs::write(file.path(), text).expect("write temp file");
    file
}

fn sample_matrix(seed: f64) -> Matrix {
    Matrix::from_rows(&[
        vec![seed, 0.1 * seed, 0.0],
        vec![0.1 * seed, 2.0 * seed, 0.3],
        vec![0.0, 0.3, 3.0 * seed],
    ])
    .expect("square")
}

#[test]
fn parsed_rows_match_data_lines() {
    let file = temp_file(HEPDATA);
    let format = TableFormat {
        fields: Some(3),
        ..TableFormat::default()
    };
    let rows = read_rows(file.path(), &format).expect("rows");
    let data_lines = HEPDATA
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .count()
        - 1;
    assert_eq!(rows.len(), data_lines);
    assert_eq!(rows[3].values, vec![2.19, 0.08, 0.21]);
}

#[test]
fn stat_and_syst_columns_sum_to_a_consistent_total() {
    let file = temp_file(HEPDATA);
    let spec = TableSpec::new(
        TableFormat {
            fields: Some(3),
            ..TableFormat::default()
        },
        TableLayout::RangeLabel {
            value: 0,
            uncertainty: 1,
        },
    );
    let table = load_table(file.path(), &spec).expect("table");
    assert_eq!(table.len(), 4);
    assert_relative_eq!(table.axis().width(3), 50.0);

    // stat-only diagonal matches the stat column exactly
    let stat = Matrix::from_diagonal(&[0.13 * 0.13, 0.14 * 0.14, 0.13 * 0.13, 0.08 * 0.08]);
    let report = ConsistencyChecker::default().check(&table, &stat);
    assert!(report.is_consistent(), "{report:?}");

    // adding syst breaks it, at every bin
    let syst = Matrix::from_diagonal(&[0.17 * 0.17, 0.25 * 0.25, 0.27 * 0.27, 0.21 * 0.21]);
    let total = combine(&[&stat, &syst]).expect("same size");
    let report = ConsistencyChecker::default().check(&table, &total);
    assert_eq!(report.mismatches.len(), 4);
}

#[test]
fn combine_is_commutative_and_associative() {
    let (a, b, c) = (sample_matrix(1.0), sample_matrix(0.5), sample_matrix(4.0));

    let ab = combine(&[&a, &b]).unwrap();
    let ba = combine(&[&b, &a]).unwrap();
    assert_eq!(ab, ba);

    let left = combine(&[&ab, &c]).unwrap();
    let bc = combine(&[&b, &c]).unwrap();
    let right = combine(&[&a, &bc]).unwrap();
    let flat = combine(&[&a, &b, &c]).unwrap();
    for i in 0..3 {
        for j in 0..3 {
            assert_relative_eq!(left.get(i, j), right.get(i, j), max_relative = 1e-15);
            assert_relative_eq!(left.get(i, j), flat.get(i, j), max_relative = 1e-15);
        }
    }
}

#[test]
fn whitespace_triples_with_numeric_indices() {
    let file = temp_file("# i j cov\n0 0 1.0\n0 1 0.5\n1 1 4.0\n2 2 9.0\n");
    let spec = MatrixSpec {
        format: TableFormat {
            delimiter: Delimiter::Whitespace,
            label: false,
            ..TableFormat::default()
        },
        layout: MatrixLayout::Triples {
            index_base: 0,
            symmetric: true,
        },
        kind: MatrixKind::Covariance,
        scale: 1.0,
    };
    let m = load_matrix(file.path(), &spec).expect("matrix");
    assert_eq!(m.dim(), 3);
    assert_eq!(m.diagonal(), vec![1.0, 4.0, 9.0]);
    assert_eq!(m.get(1, 0), 0.5);
    assert!(m.is_symmetric(1e-12));
}

#[test]
fn non_square_dense_matrix_is_a_format_error() {
    let file = temp_file("1 0\n0 1\n0 0\n");
    let spec = MatrixSpec {
        format: TableFormat {
            delimiter: Delimiter::Whitespace,
            label: false,
            ..TableFormat::default()
        },
        layout: MatrixLayout::Dense,
        kind: MatrixKind::Covariance,
        scale: 1.0,
    };
    let err = load_matrix(file.path(), &spec).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FormatError>(),
        Some(FormatError::NotSquare { rows: 3, .. })
    ));
}
