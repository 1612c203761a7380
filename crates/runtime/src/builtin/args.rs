use crate::codec::Kwargs;
use crate::error::OperatorError;
use crate::value::Value;

/// Positional-or-keyword argument lookup.
pub(crate) struct CallArgs<'a> {
    pub positional: &'a [Value],
    pub kwargs: &'a Kwargs,
}

impl<'a> CallArgs<'a> {
    pub fn new(positional: &'a [Value], kwargs: &'a Kwargs) -> Self {
        Self { positional, kwargs }
    }

    pub fn get(&self, index: usize, name: &str) -> Option<&'a Value> {
        self.positional.get(index).or_else(|| self.kwargs.get(name))
    }

    pub fn require(&self, index: usize, name: &str) -> Result<&'a Value, OperatorError> {
        self.get(index, name)
            .ok_or_else(|| OperatorError::Argument(format!("missing argument '{name}'")))
    }

    pub fn require_str(&self, index: usize, name: &str) -> Result<&'a str, OperatorError> {
        let value = self.require(index, name)?;
        value.as_str().ok_or_else(|| {
            OperatorError::Type(format!("argument '{name}' must be str, got {}", value.type_name()))
        })
    }

    /// Reject anything past the expected arity, unknown keywords, and
    /// keywords naming a parameter already given by position.
    pub fn expect_at_most(&self, names: &[&str]) -> Result<(), OperatorError> {
        if self.positional.len() > names.len() {
            return Err(OperatorError::Argument(format!(
                "expected at most {} positional arguments, got {}",
                names.len(),
                self.positional.len()
            )));
        }
        if let Some(unknown) = self.kwargs.keys().find(|k| !names.contains(&k.as_str())) {
            return Err(OperatorError::Argument(format!("unexpected keyword argument '{unknown}'")));
        }
        if let Some(taken) = names[..self.positional.len()]
            .iter()
            .find(|name| self.kwargs.contains_key(**name))
        {
            return Err(OperatorError::Argument(format!("got multiple values for argument '{taken}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_and_keyword_lookup() {
        let positional = vec![Value::Int(1)];
        let kwargs = Kwargs::from([("y".to_string(), Value::Int(2))]);
        let args = CallArgs::new(&positional, &kwargs);
        assert_eq!(args.require(0, "x").unwrap(), &Value::Int(1));
        assert_eq!(args.require(1, "y").unwrap(), &Value::Int(2));
        assert!(args.require(2, "z").is_err());
        assert!(args.expect_at_most(&["x", "y"]).is_ok());
        assert!(args.expect_at_most(&["x"]).is_err());
    }

    #[test]
    fn same_parameter_twice_is_rejected() {
        let positional = vec![Value::Int(1)];
        let kwargs = Kwargs::from([("x".to_string(), Value::Int(9))]);
        let err = CallArgs::new(&positional, &kwargs)
            .expect_at_most(&["x", "y"])
            .unwrap_err();
        assert!(matches!(err, OperatorError::Argument(m) if m.contains("multiple values for argument 'x'")));
    }
}
