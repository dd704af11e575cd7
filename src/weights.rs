// Weight files (safetensors): parse, place, apply.
//
// Loading and device placement are separate steps: `WeightFile::load` parses to
// host memory, `to_device` moves tensors (a no-op when already there), and
// `apply` writes them into VarMap variables under a name prefix, strictly or
// tolerantly.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::EldmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Any missing, unexpected or mis-shaped key is an error.
    Strict,
    /// Mismatches are reported and skipped.
    Tolerant,
}

/// Outcome of applying a weight file to a set of variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

pub struct WeightFile {
    pub path: PathBuf,
    tensors: HashMap<String, Tensor>,
}

impl WeightFile {
    pub fn load(path: &Path) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("loading weights from {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            tensors,
        })
    }

    pub fn from_tensors(path: impl Into<PathBuf>, tensors: HashMap<String, Tensor>) -> Self {
        Self {
            path: path.into(),
            tensors,
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn to_device(self, device: &Device) -> Result<Self> {
        let mut tensors = HashMap::with_capacity(self.tensors.len());
        for (name, t) in self.tensors {
            let placed = if t.device().same_device(device) {
                t
            } else {
                t.to_device(device)?
            };
            tensors.insert(name, placed);
        }
        Ok(Self {
            path: self.path,
            tensors,
        })
    }

    /// Write tensors into the variables of `varmap` whose names start with
    /// `prefix`. File key `k` targets variable `prefix + k`.
    pub fn apply(&self, varmap: &VarMap, prefix: &str, mode: LoadMode) -> Result<LoadReport> {
        let targets: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
            data.iter()
                .filter_map(|(name, var)| {
                    name.strip_prefix(prefix).map(|key| (key.to_string(), var.clone()))
                })
                .collect()
        };
        self.apply_named(targets, mode)
    }

    /// Tensors whose keys satisfy `keep`, under the same source path.
    pub fn subset(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            path: self.path.clone(),
            tensors: self
                .tensors
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect(),
        }
    }

    /// Write tensors into explicitly named variables; file key `k` targets the
    /// variable paired with `k`. In strict mode nothing is written unless every
    /// key matches.
    pub fn apply_named(&self, mut targets: Vec<(String, Var)>, mode: LoadMode) -> Result<LoadReport> {
        let source_name = self.path.display().to_string();
        let mut report = LoadReport::default();
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut writes: Vec<(&Var, &Tensor)> = Vec::with_capacity(targets.len());
        for (key, var) in &targets {
            match self.tensors.get(key) {
                None => report.missing.push(key.clone()),
                Some(t) if t.dims() != var.as_tensor().dims() => {
                    if mode == LoadMode::Strict {
                        return Err(EldmError::ShapeMismatch {
                            key: key.clone(),
                            expected: var.as_tensor().dims().to_vec(),
                            got: t.dims().to_vec(),
                        }
                        .into());
                    }
                    report.mismatched.push(key.clone());
                }
                Some(t) => writes.push((var, t)),
            }
        }

        let known: HashSet<&str> = targets.iter().map(|(k, _)| k.as_str()).collect();
        let mut unexpected: Vec<String> = self
            .tensors
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect();
        unexpected.sort();
        report.unexpected = unexpected;

        if mode == LoadMode::Strict {
            if !report.missing.is_empty() {
                return Err(EldmError::MissingKeys {
                    source_name,
                    keys: report.missing,
                }
                .into());
            }
            if !report.unexpected.is_empty() {
                return Err(EldmError::UnexpectedKeys {
                    source_name,
                    keys: report.unexpected,
                }
                .into());
            }
        } else if !report.is_clean() {
            warn!(
                "[CHECKPOINT] {source_name}: {} missing, {} unexpected, {} mismatched keys",
                report.missing.len(),
                report.unexpected.len(),
                report.mismatched.len()
            );
        }

        for (var, t) in writes {
            let t = t
                .to_device(var.as_tensor().device())?
                .to_dtype(var.as_tensor().dtype())?;
            var.set(&t)?;
            report.loaded += 1;
        }
        info!(
            "[CHECKPOINT] Loaded {}/{} params from {source_name}",
            report.loaded,
            targets.len()
        );
        Ok(report)
    }
}

/// Snapshot variables under `prefix` (prefix stripped) as named tensors.
pub fn collect_prefixed(varmap: &VarMap, prefix: &str) -> Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
    Ok(data
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(name, var)| (name[prefix.len()..].to_string(), var.as_tensor().clone()))
        .collect())
}

pub fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    candle_core::safetensors::save(tensors, path)
        .with_context(|| format!("saving weights to {}", path.display()))?;
    info!("[CHECKPOINT] Saved {} params to {}", tensors.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn varmap_with(names: &[(&str, (usize, usize))]) -> Result<VarMap> {
        let varmap = VarMap::new();
        for (name, shape) in names {
            varmap.get(*shape, name, candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)?;
        }
        Ok(varmap)
    }

    fn file_with(entries: &[(&str, (usize, usize), f32)]) -> Result<WeightFile> {
        let mut tensors = HashMap::new();
        for (name, shape, value) in entries {
            tensors.insert(
                name.to_string(),
                (Tensor::ones(*shape, DType::F32, &Device::Cpu)? * *value as f64)?,
            );
        }
        Ok(WeightFile::from_tensors("mem.safetensors", tensors))
    }

    #[test]
    fn test_strict_apply_sets_values() -> Result<()> {
        let varmap = varmap_with(&[("enc.a", (2, 2)), ("enc.b", (3, 1)), ("other.c", (1, 1))])?;
        let file = file_with(&[("a", (2, 2), 2.0), ("b", (3, 1), 3.0)])?;
        let report = file.apply(&varmap, "enc.", LoadMode::Strict)?;
        assert_eq!(report.loaded, 2);
        assert!(report.is_clean());

        let saved = collect_prefixed(&varmap, "enc.")?;
        let a = saved["a"].flatten_all()?.to_vec1::<f32>()?;
        assert!(a.iter().all(|&v| v == 2.0));
        Ok(())
    }

    #[test]
    fn test_strict_rejects_missing_key() -> Result<()> {
        let varmap = varmap_with(&[("enc.a", (2, 2)), ("enc.b", (3, 1))])?;
        let file = file_with(&[("a", (2, 2), 1.0)])?;
        let err = file.apply(&varmap, "enc.", LoadMode::Strict).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EldmError>(),
            Some(EldmError::MissingKeys { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_strict_rejects_shape_mismatch() -> Result<()> {
        let varmap = varmap_with(&[("enc.a", (2, 2))])?;
        let file = file_with(&[("a", (4, 1), 1.0)])?;
        let err = file.apply(&varmap, "enc.", LoadMode::Strict).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EldmError>(),
            Some(EldmError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_failed_strict_apply_leaves_vars_untouched() -> Result<()> {
        let varmap = varmap_with(&[("enc.a", (2, 2)), ("enc.b", (3, 1)), ("enc.c", (1, 1))])?;
        // "a" sorts first and matches; "b" is mis-shaped, "c" is missing
        let file = file_with(&[("a", (2, 2), 9.0), ("b", (1, 3), 9.0)])?;
        assert!(file.apply(&varmap, "enc.", LoadMode::Strict).is_err());
        let file = file_with(&[("a", (2, 2), 9.0), ("b", (3, 1), 9.0)])?;
        assert!(file.apply(&varmap, "enc.", LoadMode::Strict).is_err());

        let saved = collect_prefixed(&varmap, "enc.")?;
        for key in ["a", "b"] {
            let values = saved[key].flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|&v| v == 0.0), "{key} was partially written");
        }
        Ok(())
    }

    #[test]
    fn test_subset_filters_keys() -> Result<()> {
        let file = file_with(&[("enc.a", (1, 1), 1.0), ("dec.b", (1, 1), 2.0)])?;
        let enc = file.subset(|k| k.starts_with("enc."));
        assert_eq!(enc.len(), 1);
        assert!(enc.get("enc.a").is_some());
        assert_eq!(enc.path, file.path);
        Ok(())
    }

    #[test]
    fn test_tolerant_reports_and_continues() -> Result<()> {
        let varmap = varmap_with(&[("enc.a", (2, 2)), ("enc.b", (3, 1)), ("enc.c", (1, 1))])?;
        let file = file_with(&[("a", (2, 2), 5.0), ("b", (1, 3), 1.0), ("zzz", (1, 1), 1.0)])?;
        let report = file.apply(&varmap, "enc.", LoadMode::Tolerant)?;
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing, vec!["c".to_string()]);
        assert_eq!(report.mismatched, vec!["b".to_string()]);
        assert_eq!(report.unexpected, vec!["zzz".to_string()]);
        Ok(())
    }

    #[test]
    fn test_save_load_roundtrip_through_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("w.safetensors");
        let varmap = varmap_with(&[("m.x", (2, 3))])?;
        file_with(&[("x", (2, 3), 4.0)])?.apply(&varmap, "m.", LoadMode::Strict)?;
        save_tensors(&collect_prefixed(&varmap, "m.")?, &path)?;

        let fresh = varmap_with(&[("n.x", (2, 3))])?;
        let file = WeightFile::load(&path)?.to_device(&Device::Cpu)?;
        file.apply(&fresh, "n.", LoadMode::Strict)?;
        let x = collect_prefixed(&fresh, "n.")?["x"].flatten_all()?.to_vec1::<f32>()?;
        assert!(x.iter().all(|&v| v == 4.0));
        Ok(())
    }
}
