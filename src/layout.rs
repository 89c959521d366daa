use crate::model::NoiseModel;
use crate::types::SignalKind;
use std::ops::Range;

/// Basis columns declared by one signal of the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalColumns {
    /// Position of the signal in `NoiseModel::signals()`.
    pub signal: usize,
    pub kind: SignalKind,
    pub name: String,
    pub col_range: Range<usize>,
}

/// Index sets over the latent coefficient vector, resolved once from the
/// model's signal list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasisLayout {
    pub width: usize,
    pub entries: Vec<SignalColumns>,
    gw: Option<usize>,
    red: Option<usize>,
    correlated: Option<usize>,
    coefficient_names: Vec<String>,
    warnings: Vec<String>,
}

impl BasisLayout {
    pub fn from_model<M: NoiseModel + ?Sized>(model: &M) -> Self {
        let signals = model.signals();
        let kinds: Vec<(SignalKind, String, Option<Range<usize>>)> = signals
            .iter()
            .map(|s| (s.kind(), s.name().to_string(), s.basis_columns()))
            .collect();
        Self::build(model.basis_width(), kinds)
    }

    fn build(width: usize, signals: Vec<(SignalKind, String, Option<Range<usize>>)>) -> Self {
        let mut entries = Vec::new();
        let mut warnings = Vec::new();
        for (signal, (kind, name, cols)) in signals.into_iter().enumerate() {
            let Some(col_range) = cols else { continue };
            if col_range.end > width || col_range.start > col_range.end {
                warnings.push(format!(
                    "signal '{name}' declares basis columns {}..{} outside the model basis width {width}",
                    col_range.start, col_range.end
                ));
                continue;
            }
            if col_range.is_empty() {
                continue;
            }
            entries.push(SignalColumns {
                signal,
                kind,
                name,
                col_range,
            });
        }

        let find = |kind: SignalKind| entries.iter().position(|e| e.kind == kind);
        let gw = find(SignalKind::GravitationalWave);
        let red = find(SignalKind::RedNoise);
        let correlated = find(SignalKind::CorrelatedNoiseBasis);

        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                let overlaps = a.col_range.start < b.col_range.end
                    && b.col_range.start < a.col_range.end;
                if overlaps && a.col_range != b.col_range {
                    warnings.push(format!(
                        "signals '{}' and '{}' partially share basis columns; coefficient alignment may be unreliable",
                        a.name, b.name
                    ));
                }
            }
        }

        // GW names win on shared columns, then the first declaring signal.
        let mut coefficient_names: Vec<Option<String>> = vec![None; width];
        let order = gw.into_iter().chain((0..entries.len()).filter(|i| Some(*i) != gw));
        for idx in order {
            let entry = &entries[idx];
            for (k, col) in entry.col_range.clone().enumerate() {
                if coefficient_names[col].is_none() {
                    coefficient_names[col] = Some(format!("{}_{k}", entry.name));
                }
            }
        }
        let uncovered = coefficient_names.iter().filter(|n| n.is_none()).count();
        if uncovered > 0 {
            warnings.push(format!(
                "basis width is {width} but signals declare only {} columns; coefficient names may be misaligned",
                width - uncovered
            ));
        }
        let coefficient_names = coefficient_names
            .into_iter()
            .enumerate()
            .map(|(col, name)| name.unwrap_or_else(|| format!("unassigned_{col}")))
            .collect();

        Self {
            width,
            entries,
            gw,
            red,
            correlated,
            coefficient_names,
            warnings,
        }
    }

    pub fn gw(&self) -> Option<&SignalColumns> {
        self.gw.map(|i| &self.entries[i])
    }

    pub fn red(&self) -> Option<&SignalColumns> {
        self.red.map(|i| &self.entries[i])
    }

    pub fn correlated(&self) -> Option<&SignalColumns> {
        self.correlated.map(|i| &self.entries[i])
    }

    /// `<signal>_<i>` for every latent coefficient.
    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    /// Basis accounting mismatches found while resolving the layout.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
