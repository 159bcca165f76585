//! The plugin-scoped registry of outputs.

use manifold_api::{
    types::{output::Output, Error},
    Result,
};
use std::{collections::HashMap, sync::Arc};

/// Maps output names to their records. Built-ins are inserted at
/// construction; a plugin may add its own at startup. The registry
/// is read-only once the scheduler starts.
pub struct OutputRegistry {
    map: HashMap<String, Arc<Output>>,
}

impl OutputRegistry {
    /// Creates a registry holding the built-in outputs and their
    /// canonical units.
    pub fn with_builtins() -> OutputRegistry {
        let mut reg = OutputRegistry {
            map: HashMap::new(),
        };

        let builtins = vec![
            Output::new("temperature")
                .with_precision(2)
                .with_unit("celsius", "C"),
            Output::new("humidity")
                .with_precision(2)
                .with_unit("percent humidity", "%"),
            Output::new("pressure")
                .with_precision(3)
                .with_unit("pascal", "Pa"),
            Output::new("voltage")
                .with_precision(5)
                .with_unit("volt", "V"),
            Output::new("electric-current")
                .with_precision(3)
                .with_unit("ampere", "A"),
            Output::new("frequency")
                .with_precision(2)
                .with_unit("hertz", "Hz"),
            Output::new("power")
                .with_precision(3)
                .with_unit("watt", "W"),
            Output::new("seconds")
                .with_precision(3)
                .with_unit("seconds", "s"),
            Output::new("state"),
            Output::new("status"),
            Output::new("count"),
        ];

        for output in builtins {
            // The built-in names are distinct by construction, so
            // this can't fail.

            let _ = reg.register(output);
        }

        reg
    }

    /// Adds an output to the registry. Registering a name that is
    /// already in use fails; outputs are shared, so redefining one
    /// under an existing name would silently change other devices'
    /// readings.
    pub fn register(&mut self, output: Output) -> Result<()> {
        if self.map.contains_key(&output.name) {
            return Err(Error::Conflict(format!(
                "output '{}' is already registered",
                &output.name
            )));
        }

        self.map.insert(output.name.clone(), Arc::new(output));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Output>> {
        self.map.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let reg = OutputRegistry::with_builtins();
        let temp = reg.get("temperature").unwrap();

        assert_eq!(temp.kind, "temperature");
        assert_eq!(
            temp.unit.as_ref().map(|u| (u.name.as_str(), u.symbol.as_str())),
            Some(("celsius", "C"))
        );

        // Unitless built-ins exist too.

        assert!(reg.get("state").unwrap().unit.is_none());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn test_register_conflict() {
        let mut reg = OutputRegistry::with_builtins();

        assert!(reg.register(Output::new("airflow")).is_ok());
        assert_eq!(
            reg.register(Output::new("airflow")),
            Err(Error::Conflict(
                "output 'airflow' is already registered".into()
            ))
        );

        // Built-ins can't be shadowed either.

        assert!(reg.register(Output::new("temperature")).is_err());
    }
}
