//! Four-blob safetensors checkpoints.
//!
//! One file per module and iteration, all sharing a run name:
//!
//! ```text
//! <dir>/<run>-gen-00200.safetensors   generator
//! <dir>/<run>-dis-00200.safetensors   critic
//! <dir>/<run>-eg-00200.safetensors    generator-side embedder
//! <dir>/<run>-ed-00200.safetensors    critic-side embedder
//! ```

use std::path::PathBuf;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::info;

use crate::{Error, Result};

/// Blob kinds in save order.
pub const BLOBS: [&str; 4] = ["gen", "dis", "eg", "ed"];

/// The four parameter stores of a run, in [`BLOBS`] order.
pub struct ModelStores<'a> {
    pub gen_vars: &'a VarMap,
    pub dis_vars: &'a VarMap,
    pub eg_vars: &'a VarMap,
    pub ed_vars: &'a VarMap,
}

impl ModelStores<'_> {
    fn by_kind(&self) -> [(&'static str, &VarMap); 4] {
        [
            (BLOBS[0], self.gen_vars),
            (BLOBS[1], self.dis_vars),
            (BLOBS[2], self.eg_vars),
            (BLOBS[3], self.ed_vars),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn blob_path(&self, run: &str, kind: &str, iteration: usize) -> PathBuf {
        self.dir.join(format!("{run}-{kind}-{iteration:05}.safetensors"))
    }

    /// Write all four blobs; returns their paths.
    pub fn save(&self, run: &str, iteration: usize, stores: &ModelStores<'_>) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.dir)?;
        let mut paths = Vec::with_capacity(BLOBS.len());
        for (kind, vars) in stores.by_kind() {
            let path = self.blob_path(run, kind, iteration);
            vars.save(&path)?;
            paths.push(path);
        }
        info!(run, iteration, dir = %self.dir.display(), "saved checkpoint");
        Ok(paths)
    }

    /// Restore all four blobs of `run` at `iteration`.
    ///
    /// Every blob is read and checked against its store (names, shapes)
    /// before any variable is overwritten, so a failed load leaves all four
    /// stores untouched.
    pub fn load(&self, run: &str, iteration: usize, stores: &ModelStores<'_>) -> Result<()> {
        let mut staged: Vec<(Var, Tensor)> = Vec::new();
        for (kind, vars) in stores.by_kind() {
            let path = self.blob_path(run, kind, iteration);
            if !path.is_file() {
                return Err(Error::Checkpoint(format!(
                    "missing {kind} blob {}",
                    path.display()
                )));
            }
            let mut tensors = candle_core::safetensors::load(&path, &Device::Cpu)
                .map_err(|e| Error::Checkpoint(format!("{}: {e}", path.display())))?;
            let data = vars
                .data()
                .lock()
                .map_err(|_| Error::Checkpoint(format!("{kind} store lock poisoned")))?;
            for (name, var) in data.iter() {
                let tensor = tensors.remove(name).ok_or_else(|| {
                    Error::Checkpoint(format!("{}: no tensor '{name}'", path.display()))
                })?;
                if tensor.dims() != var.dims() {
                    return Err(Error::Checkpoint(format!(
                        "{}: '{name}' has shape {:?}, expected {:?}",
                        path.display(),
                        tensor.dims(),
                        var.dims()
                    )));
                }
                let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
                staged.push((var.clone(), tensor));
            }
        }
        for (var, tensor) in &staged {
            var.set(tensor)?;
        }
        info!(run, iteration, tensors = staged.len(), "restored checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn store_with(value: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "w", Init::Const(value)).unwrap();
        varmap
    }

    fn first_value(varmap: &VarMap) -> f32 {
        let data = varmap.data().lock().unwrap();
        let t: &Tensor = data["w"].as_tensor();
        t.to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn save_writes_four_named_blobs_and_load_restores() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let (g, d, eg, ed) = (store_with(1.0), store_with(2.0), store_with(3.0), store_with(4.0));
        let stores = ModelStores {
            gen_vars: &g,
            dis_vars: &d,
            eg_vars: &eg,
            ed_vars: &ed,
        };
        let paths = store.save("run", 200, &stores).unwrap();
        assert_eq!(paths.len(), 4);
        assert!(paths[0].ends_with("run-gen-00200.safetensors"));
        assert!(paths.iter().all(|p| p.is_file()));

        let (g2, d2, eg2, ed2) = (store_with(0.0), store_with(0.0), store_with(0.0), store_with(0.0));
        let restored = ModelStores {
            gen_vars: &g2,
            dis_vars: &d2,
            eg_vars: &eg2,
            ed_vars: &ed2,
        };
        store.load("run", 200, &restored).unwrap();
        assert_eq!(first_value(&g2), 1.0);
        assert_eq!(first_value(&ed2), 4.0);
    }

    #[test]
    fn load_fails_when_a_blob_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let v = store_with(1.0);
        let stores = ModelStores {
            gen_vars: &v,
            dis_vars: &v,
            eg_vars: &v,
            ed_vars: &v,
        };
        store.save("run", 5, &stores).unwrap();
        std::fs::remove_file(store.blob_path("run", "eg", 5)).unwrap();

        let fresh = store_with(9.0);
        let target = ModelStores {
            gen_vars: &fresh,
            dis_vars: &fresh,
            eg_vars: &fresh,
            ed_vars: &fresh,
        };
        assert!(matches!(
            store.load("run", 5, &target),
            Err(Error::Checkpoint(_))
        ));
        assert_eq!(first_value(&fresh), 9.0);
    }

    #[test]
    fn corrupt_blob_leaves_every_store_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let (g, d, eg, ed) = (store_with(1.0), store_with(2.0), store_with(3.0), store_with(4.0));
        let saved = ModelStores {
            gen_vars: &g,
            dis_vars: &d,
            eg_vars: &eg,
            ed_vars: &ed,
        };
        store.save("run", 7, &saved).unwrap();
        let eg_path = store.blob_path("run", "eg", 7);
        let bytes = std::fs::read(&eg_path).unwrap();
        std::fs::write(&eg_path, &bytes[..bytes.len() / 2]).unwrap();

        let (g2, d2, eg2, ed2) = (store_with(0.0), store_with(0.0), store_with(0.0), store_with(0.0));
        let target = ModelStores {
            gen_vars: &g2,
            dis_vars: &d2,
            eg_vars: &eg2,
            ed_vars: &ed2,
        };
        assert!(matches!(
            store.load("run", 7, &target),
            Err(Error::Checkpoint(_))
        ));
        // Blobs before the corrupt one were readable but must not be applied.
        assert_eq!(first_value(&g2), 0.0);
        assert_eq!(first_value(&d2), 0.0);
        assert_eq!(first_value(&ed2), 0.0);
    }

    #[test]
    fn shape_mismatch_is_rejected_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let v = store_with(1.0);
        let stores = ModelStores {
            gen_vars: &v,
            dis_vars: &v,
            eg_vars: &v,
            ed_vars: &v,
        };
        store.save("run", 3, &stores).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(4, "w", Init::Const(5.0)).unwrap();
        let ok = store_with(0.0);
        let target = ModelStores {
            gen_vars: &ok,
            dis_vars: &ok,
            eg_vars: &ok,
            ed_vars: &varmap,
        };
        assert!(matches!(
            store.load("run", 3, &target),
            Err(Error::Checkpoint(_))
        ));
        assert_eq!(first_value(&ok), 0.0);
    }
}
