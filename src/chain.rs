use crate::adaptive::BlockTuning;
use crate::engine::EngineState;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PARAM_NAMES_FILE: &str = "pars_chain.txt";
pub const COEFFICIENT_NAMES_FILE: &str = "pars_bchain.txt";
pub const PARAM_CHAIN_FILE: &str = "chain.txt";
pub const COEFFICIENT_CHAIN_FILE: &str = "bchain.txt";
pub const RESUME_FILE: &str = "resume.json";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed chain file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} row {row}: cannot parse '{value}' as a number")]
    Parse {
        path: PathBuf,
        row: usize,
        value: String,
    },
    #[error("{path} row {row} has {found} columns, expected {expected}")]
    Shape {
        path: PathBuf,
        row: usize,
        expected: usize,
        found: usize,
    },
}

impl ChainError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ChainError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory parameter and latent-coefficient chains, one row per iteration.
#[derive(Debug, Clone)]
pub struct Chain {
    params: Array2<f64>,
    coefficients: Array2<f64>,
}

impl Chain {
    pub fn new(iterations: usize, n_params: usize, n_coefficients: usize) -> Self {
        Self {
            params: Array2::zeros((iterations, n_params)),
            coefficients: Array2::zeros((iterations, n_coefficients)),
        }
    }

    pub fn iterations(&self) -> usize {
        self.params.nrows()
    }

    pub fn record(&mut self, ii: usize, x: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) {
        self.params.row_mut(ii).assign(&x);
        self.coefficients.row_mut(ii).assign(&b);
    }

    /// Copy reloaded rows into the start of the buffers.
    pub fn seed_prefix(&mut self, params: ArrayView2<'_, f64>, coefficients: ArrayView2<'_, f64>) {
        let rows = params.nrows().min(self.iterations());
        self.params
            .slice_mut(s![..rows, ..])
            .assign(&params.slice(s![..rows, ..]));
        if self.coefficients.ncols() > 0 {
            self.coefficients
                .slice_mut(s![..rows, ..])
                .assign(&coefficients.slice(s![..rows, ..]));
        }
    }

    pub fn params(&self) -> ArrayView2<'_, f64> {
        self.params.view()
    }

    pub fn coefficients(&self) -> ArrayView2<'_, f64> {
        self.coefficients.view()
    }

    /// Write rows `0..rows` of both chains into `dir`.
    pub fn write_prefix(&self, dir: &Path, rows: usize) -> Result<(), ChainError> {
        write_matrix(
            &dir.join(PARAM_CHAIN_FILE),
            self.params.slice(s![..rows, ..]),
        )?;
        write_matrix(
            &dir.join(COEFFICIENT_CHAIN_FILE),
            self.coefficients.slice(s![..rows, ..]),
        )
    }
}

/// Everything needed to continue a run exactly where the last checkpoint
/// left it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub next_iteration: usize,
    pub params: Array1<f64>,
    pub coefficients: Array1<f64>,
    pub white_tuning: Option<BlockTuning>,
    pub engine: Option<EngineState>,
}

/// Chains reloaded from an output directory.
#[derive(Debug, Clone)]
pub struct ReloadedChain {
    pub params: Array2<f64>,
    pub coefficients: Array2<f64>,
    /// Common row count of both chains.
    pub rows: usize,
    pub resume: Option<ResumeState>,
}

pub fn create_output_dir(dir: &Path) -> Result<(), ChainError> {
    fs::create_dir_all(dir).map_err(|e| ChainError::io(dir, e))
}

/// One name per line.
pub fn write_names(path: &Path, names: &[String]) -> Result<(), ChainError> {
    let file = File::create(path).map_err(|e| ChainError::io(path, e))?;
    let mut out = BufWriter::new(file);
    for name in names {
        writeln!(out, "{name}").map_err(|e| ChainError::io(path, e))?;
    }
    out.flush().map_err(|e| ChainError::io(path, e))
}

/// Space-separated rows in shortest round-trip exponent form, written to a
/// sibling temp file and renamed into place.
pub fn write_matrix(path: &Path, rows: ArrayView2<'_, f64>) -> Result<(), ChainError> {
    let tmp = path.with_extension("txt.tmp");
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .from_path(&tmp)
            .map_err(|source| ChainError::Csv {
                path: tmp.clone(),
                source,
            })?;
        if rows.ncols() > 0 {
            for row in rows.rows() {
                writer
                    .write_record(row.iter().map(|v| format!("{v:e}")))
                    .map_err(|source| ChainError::Csv {
                        path: tmp.clone(),
                        source,
                    })?;
            }
        }
        writer.flush().map_err(|e| ChainError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| ChainError::io(path, e))
}

/// Read a matrix written by [`write_matrix`]. An empty file is a 0x0 matrix.
pub fn read_matrix(path: &Path) -> Result<Array2<f64>, ChainError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|source| ChainError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
    let mut values = Vec::new();
    let mut ncols = None;
    let mut nrows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|source| ChainError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let expected = *ncols.get_or_insert(record.len());
        if record.len() != expected {
            return Err(ChainError::Shape {
                path: path.to_path_buf(),
                row,
                expected,
                found: record.len(),
            });
        }
        for field in record.iter() {
            let value = field.trim().parse::<f64>().map_err(|_| ChainError::Parse {
                path: path.to_path_buf(),
                row,
                value: field.to_string(),
            })?;
            values.push(value);
        }
        nrows += 1;
    }
    let ncols = ncols.unwrap_or(0);
    Array2::from_shape_vec((nrows, ncols), values).map_err(|_| ChainError::Shape {
        path: path.to_path_buf(),
        row: nrows,
        expected: ncols,
        found: 0,
    })
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ChainError> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp).map_err(|e| ChainError::io(&tmp, e))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, value).map_err(|source| ChainError::Json {
            path: tmp.clone(),
            source,
        })?;
        out.flush().map_err(|e| ChainError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| ChainError::io(path, e))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ChainError> {
    let file = File::open(path).map_err(|e| ChainError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| ChainError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_checkpoint(
    dir: &Path,
    chain: &Chain,
    rows: usize,
    resume: &ResumeState,
) -> Result<(), ChainError> {
    chain.write_prefix(dir, rows)?;
    write_json(&dir.join(RESUME_FILE), resume)
}

/// Reload the chains of a previous run in `dir`. Returns `None` when no
/// parameter chain exists. A zero-width coefficient chain does not limit the
/// common row count.
pub fn reload(dir: &Path, n_params: usize, n_coefficients: usize) -> Result<Option<ReloadedChain>, ChainError> {
    let params_path = dir.join(PARAM_CHAIN_FILE);
    if !params_path.exists() {
        return Ok(None);
    }
    let params = read_matrix(&params_path)?;
    check_width(&params_path, &params, n_params)?;

    let coefficients_path = dir.join(COEFFICIENT_CHAIN_FILE);
    let (coefficients, rows) = if n_coefficients == 0 {
        (Array2::zeros((params.nrows(), 0)), params.nrows())
    } else if coefficients_path.exists() {
        let coefficients = read_matrix(&coefficients_path)?;
        check_width(&coefficients_path, &coefficients, n_coefficients)?;
        let rows = params.nrows().min(coefficients.nrows());
        (coefficients, rows)
    } else {
        (Array2::zeros((0, n_coefficients)), 0)
    };

    let resume_path = dir.join(RESUME_FILE);
    let resume = if resume_path.exists() {
        Some(read_json(&resume_path)?)
    } else {
        None
    };
    Ok(Some(ReloadedChain {
        params,
        coefficients,
        rows,
        resume,
    }))
}

fn check_width(path: &Path, matrix: &Array2<f64>, expected: usize) -> Result<(), ChainError> {
    if matrix.nrows() > 0 && matrix.ncols() != expected {
        return Err(ChainError::Shape {
            path: path.to_path_buf(),
            row: 0,
            expected,
            found: matrix.ncols(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn matrices_round_trip_exactly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chain.txt");
        let m = array![[1.0 / 3.0, -2.5e-17, 0.0], [std::f64::consts::PI, 1e300, -7.0]];
        write_matrix(&path, m.view()).expect("write");
        assert!(!path.with_extension("txt.tmp").exists());
        let back = read_matrix(&path).expect("read");
        assert_eq!(back, m);
    }

    #[test]
    fn zero_width_chain_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bchain.txt");
        write_matrix(&path, Array2::<f64>::zeros((4, 0)).view()).expect("write");
        let back = read_matrix(&path).expect("read");
        assert_eq!(back.dim(), (0, 0));
    }

    #[test]
    fn reload_takes_common_minimum_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut chain = Chain::new(10, 2, 3);
        for ii in 0..10 {
            let v = ii as f64;
            chain.record(ii, array![v, -v].view(), array![v, v, v].view());
        }
        write_matrix(&dir.path().join(PARAM_CHAIN_FILE), chain.params().slice(s![..6, ..]))
            .expect("params");
        write_matrix(
            &dir.path().join(COEFFICIENT_CHAIN_FILE),
            chain.coefficients().slice(s![..4, ..]),
        )
        .expect("coefficients");
        let reloaded = reload(dir.path(), 2, 3).expect("reload").expect("present");
        assert_eq!(reloaded.rows, 4);
        assert!(reloaded.resume.is_none());

        let mut fresh = Chain::new(10, 2, 3);
        fresh.seed_prefix(
            reloaded.params.slice(s![..reloaded.rows, ..]),
            reloaded.coefficients.slice(s![..reloaded.rows, ..]),
        );
        assert_eq!(fresh.params().row(3), array![3.0, -3.0]);
        assert_eq!(fresh.params().row(4), array![0.0, 0.0]);
    }

    #[test]
    fn reload_without_files_is_none_and_wrong_width_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(reload(dir.path(), 2, 0).expect("reload").is_none());
        write_matrix(&dir.path().join(PARAM_CHAIN_FILE), array![[1.0, 2.0, 3.0]].view())
            .expect("write");
        assert!(matches!(
            reload(dir.path(), 2, 0),
            Err(ChainError::Shape { expected: 2, found: 3, .. })
        ));
    }

    #[test]
    fn resume_state_survives_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(RESUME_FILE);
        let state = ResumeState {
            next_iteration: 12,
            params: array![0.1 + 0.2, -1e-9],
            coefficients: array![1.0 / 7.0],
            white_tuning: Some(BlockTuning {
                covariance: array![[0.25]],
                sigma: array![0.5],
                thinning: 3,
                acceptance_rate: 0.41,
            }),
            engine: None,
        };
        write_json(&path, &state).expect("write");
        let back: ResumeState = read_json(&path).expect("read");
        assert_eq!(back, state);
    }

    #[test]
    fn names_are_one_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(PARAM_NAMES_FILE);
        write_names(&path, &["a".to_string(), "b_0".to_string()]).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "a\nb_0\n");
    }
}
