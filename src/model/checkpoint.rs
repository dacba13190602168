use std::{fs, path::Path};

use super::{Model, ModelError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A snapshot of a global model.
pub struct Checkpoint {
    pub model: String,
    pub round: u32,
    pub parameters: Vec<f32>,
}

impl Checkpoint {
    pub fn of(model: &dyn Model, round: u32) -> Self {
        Self {
            model: model.name().to_string(),
            round,
            parameters: model.parameters().to_vec(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let error = |message: String| ModelError::Checkpoint {
            path: path.to_path_buf(),
            message,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| error(e.to_string()))?;
        }
        let json = serde_json::to_vec(self).map_err(|e| error(e.to_string()))?;
        fs::write(path, json).map_err(|e| error(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let error = |message: String| ModelError::Checkpoint {
            path: path.to_path_buf(),
            message,
        };
        let content = fs::read(path).map_err(|e| error(e.to_string()))?;
        serde_json::from_slice(&content).map_err(|e| error(e.to_string()))
    }

    /// Load the parameters into `model`.
    ///
    /// # Errors
    /// Fails if the checkpoint was taken from another kind of model or from a model of
    /// another size.
    pub fn restore(&self, model: &mut dyn Model) -> Result<(), ModelError> {
        if self.model != model.name() {
            return Err(ModelError::Checkpoint {
                path: Default::default(),
                message: format!(
                    "checkpoint holds a {} model, not a {} model",
                    self.model,
                    model.name()
                ),
            });
        }
        model.set_parameters(&self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;
    use crate::{data::ImageShape, model::get_model};

    #[test]
    fn test_save_and_restore() {
        let shape = ImageShape::square(1, 3);
        let trained = get_model("MLP", shape, 2, 1).unwrap();
        let path = env::temp_dir()
            .join(format!("fedrun-checkpoint-{}", uuid::Uuid::new_v4()))
            .join("model_Round_2.json");
        Checkpoint::of(trained.as_ref(), 2).save(&path).unwrap();

        let checkpoint = Checkpoint::load(&path).unwrap();
        assert_eq!(checkpoint.round, 2);
        let mut fresh = get_model("MLP", shape, 2, 7).unwrap();
        checkpoint.restore(fresh.as_mut()).unwrap();
        assert_eq!(fresh.parameters(), trained.parameters());

        let mut other = get_model("CNN", shape, 2, 1).unwrap();
        assert!(checkpoint.restore(other.as_mut()).is_err());
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_missing_checkpoint() {
        assert!(matches!(
            Checkpoint::load(Path::new("/nonexistent/model.json")),
            Err(ModelError::Checkpoint { .. })
        ));
    }
}
