//! Arguments passed from a script to a host function.

use std::collections::HashMap;

use anyhow::{bail, Result};
use mlua::{Lua, MultiValue, Value};

/// The values a script passed to a host function.
///
/// Strings and numbers are kept as text; any other Lua value is recorded as
/// unusable and rejected when popped.
#[derive(Debug, Clone, Default)]
pub struct ParamStack {
    values: Vec<Option<String>>,
}

impl ParamStack {
    /// Capture the call arguments of a host function.
    pub fn from_lua(lua: &Lua, args: MultiValue) -> mlua::Result<Self> {
        let mut values = Vec::with_capacity(args.len());
        for value in args {
            let text = match value {
                Value::String(s) => Some(s.to_string_lossy().to_string()),
                Value::Integer(_) | Value::Number(_) => lua
                    .coerce_string(value)?
                    .map(|s| s.to_string_lossy().to_string()),
                _ => None,
            };
            values.push(text);
        }
        Ok(Self { values })
    }

    /// Number of values still on the stack.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pop `names.len()` values off the top of the stack.
    ///
    /// The deepest popped value is bound to `names[0]`, so a call
    /// `f("a", "b")` popped with `["x", "y"]` yields `x = "a"` and `y = "b"`.
    pub fn pop_named(&mut self, names: &[&str]) -> Result<HashMap<String, String>> {
        if self.values.len() < names.len() {
            bail!(
                "expected {} argument(s) ({}), got {}",
                names.len(),
                names.join(", "),
                self.values.len()
            );
        }

        let top = self.values.split_off(self.values.len() - names.len());
        let mut params = HashMap::with_capacity(names.len());
        for (name, value) in names.iter().zip(top) {
            match value {
                Some(text) => {
                    params.insert((*name).to_string(), text);
                }
                None => bail!("argument '{}' must be a string or number", name),
            }
        }
        Ok(params)
    }
}

impl<S: Into<String>> FromIterator<S> for ParamStack {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|s| Some(s.into())).collect(),
        }
    }
}
