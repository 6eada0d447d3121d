use tempfile::tempdir;
use xsec_convert::data::container::{read_container, write_container, Container, ObjectKind};
use xsec_convert::data::model::{BinAxis, Histogram1D, Histogram2D, Matrix};

fn sample_container() -> Container {
    let axis = BinAxis::new(vec![0.0, 0.25, 0.5, 1.0]).expect("axis");
    let mut data = Histogram1D::zeros("MINERvA_CCQE_XSec_1DQ2_nu_data", "Q2 (GeV^2)", axis.clone());
    data.contents = vec![1.2e-38, 7.5e-39, 2.1e-39];
    data.errors = vec![1.1e-39, 6.0e-40, 3.3e-40];

    let cov = Matrix::from_rows(&[
        vec![1.21e-78, 2.0e-79, 0.0],
        vec![2.0e-79, 3.6e-79, -1.0e-80],
        vec![0.0, -1.0e-80, 1.089e-79],
    ])
    .expect("square");

    let x = BinAxis::new(vec![0.0, 1.0, 2.0]).expect("x");
    let y = BinAxis::new(vec![-1.0, 0.0, 0.5, 1.0]).expect("y");
    let mut grid = Histogram2D::zeros("T2K_CC0pi_data2d", "p_mu vs cos", x, y);
    grid.set(0, 2, 4.0, 0.5);
    grid.set(1, 1, 6.0, 0.75);

    let mut container = Container::new();
    container.add_histogram(&data);
    container.add_matrix("MINERvA_CCQE_XSec_1DQ2_nu_totcov", "", &cov, Some(&axis));
    container.add_histogram2d(&grid);
    container
}

#[test]
fn parquet_roundtrip_is_exact() {
    let temp = tempdir().expect("tmp dir");
    let path = temp.path().join("out.parquet");
    let container = sample_container();
    write_container(&path, &container).expect("write");
    let back = read_container(&path).expect("read");
    assert_eq!(back, container);

    let cov = back
        .get("MINERvA_CCQE_XSec_1DQ2_nu_totcov")
        .expect("stored")
        .to_matrix()
        .expect("matrix");
    assert_eq!(cov.get(1, 2), -1.0e-80);
    let grid = back.get("T2K_CC0pi_data2d").unwrap().to_histogram2d().unwrap();
    assert_eq!(grid.get(0, 2), 4.0);
    assert_eq!(grid.error(1, 1), 0.75);
}

#[test]
fn json_roundtrip_is_exact() {
    let temp = tempdir().expect("tmp dir");
    let path = temp.path().join("out.json");
    let container = sample_container();
    write_container(&path, &container).expect("write");
    let back = read_container(&path).expect("read");
    assert_eq!(back, container);
    assert_eq!(
        back.iter().map(|o| o.kind).collect::<Vec<_>>(),
        vec![ObjectKind::Hist1d, ObjectKind::Matrix, ObjectKind::Hist2d]
    );
}

#[test]
fn writing_replaces_an_existing_file() {
    let temp = tempdir().expect("tmp dir");
    let path = temp.path().join("out.parquet");
    write_container(&path, &sample_container()).expect("first write");

    let mut smaller = Container::new();
    smaller.add_matrix("only", "", &Matrix::from_diagonal(&[1.0, 2.0]), None);
    write_container(&path, &smaller).expect("second write");

    let back = read_container(&path).expect("read");
    assert_eq!(back.len(), 1);
    assert_eq!(back.names().collect::<Vec<_>>(), vec!["only"]);
}

#[test]
fn unknown_extension_is_rejected() {
    let temp = tempdir().expect("tmp dir");
    let path = temp.path().join("out.root");
    assert!(write_container(&path, &sample_container()).is_err());
    assert!(!path.exists());
}

#[test]
fn json_refuses_non_finite_numbers() {
    let temp = tempdir().expect("tmp dir");
    let mut container = sample_container();
    container.add_matrix("bad", "", &Matrix::from_diagonal(&[1.0, f64::NAN]), None);

    let path = temp.path().join("out.json");
    let err = write_container(&path, &container).unwrap_err();
    assert!(err.to_string().contains("'bad'"), "{err}");
    assert!(!path.exists());

    // Parquet keeps them
    let path = temp.path().join("out.parquet");
    write_container(&path, &container).expect("write");
    let back = read_container(&path).expect("read");
    let bad = back.get("bad").unwrap().to_matrix().unwrap();
    assert!(bad.get(1, 1).is_nan());
}
