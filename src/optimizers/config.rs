//! Serializable optimizer configuration.
//!
//! ```json
//! { "type": "adam", "learning_rate": 0.01, "clip": { "type": "norm", "clip_norm": 1.0 } }
//! ```
//!
//! Missing hyperparameters fall back to each algorithm's defaults.

use super::{
    AdaDelta, AdaDeltaConfig, AdaGrad, AdaGradConfig, AdaGradDA, AdaGradDAConfig, Adam, AdamConfig, Adamax,
    AdamaxConfig, ClipGradientAction, ClipGradientByAvgNorm, ClipGradientByNorm, ClipGradientByValue, Ftrl,
    FtrlConfig, Momentum, MomentumConfig, NoClipGradient, Optimizer, OptimizerError, OptimizerResult, RmsProp,
    RmsPropConfig, Sgd, SgdConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Algorithm {
    #[serde(rename = "sgd")]
    Sgd(SgdConfig),
    #[serde(rename = "momentum")]
    Momentum(MomentumConfig),
    #[serde(rename = "adagrad")]
    AdaGrad(AdaGradConfig),
    #[serde(rename = "adagrad_da")]
    AdaGradDA(AdaGradDAConfig),
    #[serde(rename = "adadelta")]
    AdaDelta(AdaDeltaConfig),
    #[serde(rename = "rmsprop")]
    RmsProp(RmsPropConfig),
    #[serde(rename = "adam")]
    Adam(AdamConfig),
    #[serde(rename = "adamax")]
    Adamax(AdamaxConfig),
    #[serde(rename = "ftrl")]
    Ftrl(FtrlConfig),
}

impl Algorithm {
    /// The same algorithm with its learning rate replaced.
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        match &mut self {
            Algorithm::Sgd(c) => c.learning_rate = learning_rate,
            Algorithm::Momentum(c) => c.learning_rate = learning_rate,
            Algorithm::AdaGrad(c) => c.learning_rate = learning_rate,
            Algorithm::AdaGradDA(c) => c.learning_rate = learning_rate,
            Algorithm::AdaDelta(c) => c.learning_rate = learning_rate,
            Algorithm::RmsProp(c) => c.learning_rate = learning_rate,
            Algorithm::Adam(c) => c.learning_rate = learning_rate,
            Algorithm::Adamax(c) => c.learning_rate = learning_rate,
            Algorithm::Ftrl(c) => c.learning_rate = learning_rate,
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClipConfig {
    #[default]
    None,
    Value { clip_value: f32 },
    Norm { clip_norm: f32 },
    AvgNorm { clip_norm: f32 },
}

impl ClipConfig {
    pub fn build(&self) -> OptimizerResult<Box<dyn ClipGradientAction>> {
        let clip: Box<dyn ClipGradientAction> = match *self {
            ClipConfig::None => Box::new(NoClipGradient),
            ClipConfig::Value { clip_value } => Box::new(ClipGradientByValue::new(clip_value)?),
            ClipConfig::Norm { clip_norm } => Box::new(ClipGradientByNorm::new(clip_norm)?),
            ClipConfig::AvgNorm { clip_norm } => Box::new(ClipGradientByAvgNorm::new(clip_norm)?),
        };
        Ok(clip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(flatten)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub clip: ClipConfig,
}

impl OptimizerConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm, clip: ClipConfig::None }
    }

    pub fn with_clip(mut self, clip: ClipConfig) -> Self {
        self.clip = clip;
        self
    }

    /// Validates the hyperparameters and builds the optimizer.
    pub fn build(&self) -> OptimizerResult<Box<dyn Optimizer>> {
        let clip = self.clip.build()?;
        let optimizer: Box<dyn Optimizer> = match self.algorithm {
            Algorithm::Sgd(c) => Box::new(Sgd::new(c)?.with_clip_gradient(clip)),
            Algorithm::Momentum(c) => Box::new(Momentum::new(c)?.with_clip_gradient(clip)),
            Algorithm::AdaGrad(c) => Box::new(AdaGrad::new(c)?.with_clip_gradient(clip)),
            Algorithm::AdaGradDA(c) => Box::new(AdaGradDA::new(c)?.with_clip_gradient(clip)),
            Algorithm::AdaDelta(c) => Box::new(AdaDelta::new(c)?.with_clip_gradient(clip)),
            Algorithm::RmsProp(c) => Box::new(RmsProp::new(c)?.with_clip_gradient(clip)),
            Algorithm::Adam(c) => Box::new(Adam::new(c)?.with_clip_gradient(clip)),
            Algorithm::Adamax(c) => Box::new(Adamax::new(c)?.with_clip_gradient(clip)),
            Algorithm::Ftrl(c) => Box::new(Ftrl::new(c)?.with_clip_gradient(clip)),
        };
        Ok(optimizer)
    }

    pub fn from_json_str(json: &str) -> OptimizerResult<Self> {
        serde_json::from_str(json).map_err(|e| OptimizerError::Config(e.to_string()))
    }

    pub fn to_json_string(&self) -> OptimizerResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| OptimizerError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = OptimizerConfig::from_json_str(r#"{ "type": "adam", "learning_rate": 0.01 }"#).unwrap();
        assert_eq!(
            config.algorithm,
            Algorithm::Adam(AdamConfig { learning_rate: 0.01, ..Default::default() })
        );
        assert_eq!(config.clip, ClipConfig::None);
        assert_eq!(config.build().unwrap().name(), "Adam");
    }

    #[test]
    fn json_round_trip_preserves_clip() {
        let config = OptimizerConfig::new(Algorithm::RmsProp(RmsPropConfig { centered: true, ..Default::default() }))
            .with_clip(ClipConfig::AvgNorm { clip_norm: 2.0 });
        let json = config.to_json_string().unwrap();
        assert!(json.contains("\"type\": \"rmsprop\""));
        assert_eq!(OptimizerConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn build_validates_hyperparameters_and_clip() {
        let bad_lr = OptimizerConfig::from_json_str(r#"{ "type": "sgd", "learning_rate": -1.0 }"#).unwrap();
        assert!(matches!(bad_lr.build(), Err(OptimizerError::InvalidHyperparameter { .. })));

        let bad_clip = OptimizerConfig::new(Algorithm::Sgd(SgdConfig::default()))
            .with_clip(ClipConfig::Value { clip_value: 0.0 });
        assert!(matches!(bad_clip.build(), Err(OptimizerError::InvalidClipValue(_))));
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        assert!(matches!(
            OptimizerConfig::from_json_str(r#"{ "type": "lion" }"#),
            Err(OptimizerError::Config(_))
        ));
    }

    #[test]
    fn every_algorithm_builds_with_defaults() {
        let names: Vec<&str> = [
            Algorithm::Sgd(Default::default()),
            Algorithm::Momentum(Default::default()),
            Algorithm::AdaGrad(Default::default()),
            Algorithm::AdaGradDA(Default::default()),
            Algorithm::AdaDelta(Default::default()),
            Algorithm::RmsProp(Default::default()),
            Algorithm::Adam(Default::default()),
            Algorithm::Adamax(Default::default()),
            Algorithm::Ftrl(Default::default()),
        ]
        .into_iter()
        .map(|a| OptimizerConfig::new(a).build().unwrap().name())
        .collect();
        assert_eq!(
            names,
            ["SGD", "Momentum", "Adagrad", "AdaGradDA", "Adadelta", "RMSProp", "Adam", "Adamax", "Ftrl"]
        );
    }
}
