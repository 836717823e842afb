use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    blocker::SubsequenceBlocker,
    filter::{MinP, TailFree, TopK, TopP, Typical},
    greedy::Greedy,
    mirostat::{MirostatV1, MirostatV2},
    penalty::Repetition,
    targeted::{ShapedTargeted, TargetedEntropy, TargetedTemperature},
    temperature::{Temperature, TemperatureSelector},
    Sampler, Selector,
};
use crate::{Error, Result};

/// A sampler or selector by registered name, with its parameters inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl SamplerConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

pub type SamplerConstructor = fn(Value) -> Result<Box<dyn Sampler>>;
pub type SelectorConstructor = fn(Value) -> Result<Box<dyn Selector>>;

fn sampler<T>(params: Value) -> Result<Box<dyn Sampler>>
where
    T: Sampler + DeserializeOwned + 'static,
{
    Ok(Box::new(serde_json::from_value::<T>(params)?))
}

fn selector<T>(params: Value) -> Result<Box<dyn Selector>>
where
    T: Selector + DeserializeOwned + 'static,
{
    Ok(Box::new(serde_json::from_value::<T>(params)?))
}

/// Name to constructor tables for every reshaper and selector.
#[derive(Clone, Default)]
pub struct SamplerRegistry {
    samplers: HashMap<String, SamplerConstructor>,
    selectors: HashMap<String, SelectorConstructor>,
}

impl SamplerRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry
            .register_sampler("Temperature", sampler::<Temperature>)
            .register_sampler("Repetition", sampler::<Repetition>)
            .register_sampler("TopK", sampler::<TopK>)
            .register_sampler("TopP", sampler::<TopP>)
            .register_sampler("MinP", sampler::<MinP>)
            .register_sampler("TailFree", sampler::<TailFree>)
            .register_sampler("Typical", sampler::<Typical>)
            .register_sampler("SubsequenceBlocker", sampler::<SubsequenceBlocker>);
        registry
            .register_selector("Greedy", selector::<Greedy>)
            .register_selector("Temperature", selector::<TemperatureSelector>)
            .register_selector("MirostatV1", |params: Value| -> Result<Box<dyn Selector>> {
                Ok(Box::new(MirostatV1::new(serde_json::from_value(params)?)))
            })
            .register_selector("MirostatV2", |params: Value| -> Result<Box<dyn Selector>> {
                Ok(Box::new(MirostatV2::new(serde_json::from_value(params)?)))
            })
            .register_selector("TargetedTemperature", |params: Value| -> Result<Box<dyn Selector>> {
                Ok(Box::new(TargetedTemperature::new(serde_json::from_value(params)?)))
            })
            .register_selector("TargetedEntropy", |params: Value| -> Result<Box<dyn Selector>> {
                Ok(Box::new(TargetedEntropy::new(serde_json::from_value(params)?)))
            })
            .register_selector("GaussianTargeted", |params: Value| -> Result<Box<dyn Selector>> {
                Ok(Box::new(ShapedTargeted::gaussian(serde_json::from_value(params)?)))
            })
            .register_selector("PowerLawTargeted", |params: Value| -> Result<Box<dyn Selector>> {
                Ok(Box::new(ShapedTargeted::power_law(serde_json::from_value(params)?)))
            })
            .register_selector("UnboundedQuadratic", |params: Value| -> Result<Box<dyn Selector>> {
                Ok(Box::new(ShapedTargeted::unbounded_quadratic(
                    serde_json::from_value(params)?,
                )))
            });
        registry
    }

    pub fn register_sampler(&mut self, name: &str, constructor: SamplerConstructor) -> &mut Self {
        self.samplers.insert(name.into(), constructor);
        self
    }

    pub fn register_selector(&mut self, name: &str, constructor: SelectorConstructor) -> &mut Self {
        self.selectors.insert(name.into(), constructor);
        self
    }

    pub fn sampler(&self, config: &SamplerConfig) -> Result<Box<dyn Sampler>> {
        match self.samplers.get(&config.kind) {
            Some(constructor) => constructor(Value::Object(config.params.clone())),
            None => Err(Error::InvalidSettings(format!(
                "unknown sampler `{}`",
                config.kind
            ))),
        }
    }

    pub fn selector(&self, config: &SamplerConfig) -> Result<Box<dyn Selector>> {
        match self.selectors.get(&config.kind) {
            Some(constructor) => constructor(Value::Object(config.params.clone())),
            None => Err(Error::InvalidSettings(format!(
                "unknown selector `{}`",
                config.kind
            ))),
        }
    }
}
