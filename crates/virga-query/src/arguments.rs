//! Parsed function arguments
//!
//! The parser hands every VirgaQL function call an ordered `name → Arg` map.
//! Op-spec factories read it through typed getters; a missing required name
//! or a wrongly typed value is an `InvalidArgument` error naming the
//! argument.

use indexmap::IndexMap;
use virga_core::{Duration, Error, Expr, Result, TimeSpec, Value};

/// One parsed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    Time(TimeSpec),
    Expr(Expr),
    List(Vec<Value>),
    Map(IndexMap<String, String>),
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<TimeSpec> for Arg {
    fn from(t: TimeSpec) -> Self {
        Arg::Time(t)
    }
}

impl From<Expr> for Arg {
    fn from(e: Expr) -> Self {
        Arg::Expr(e)
    }
}

/// Ordered argument map for one function call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    args: IndexMap<String, Arg>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.args.insert(name.into(), arg.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, arg: impl Into<Arg>) {
        self.args.insert(name.into(), arg.into());
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn get(&self, name: &str) -> Option<&Arg> {
        self.args.get(name)
    }

    fn missing(name: &str) -> Error {
        Error::InvalidArgument(format!("missing required argument {:?}", name))
    }

    fn mismatch(name: &str, want: &str, got: &Arg) -> Error {
        let got = match got {
            Arg::Value(v) => v.type_name(),
            Arg::Time(_) => "time",
            Arg::Expr(_) => "expression",
            Arg::List(_) => "list",
            Arg::Map(_) => "map",
        };
        Error::InvalidArgument(format!("argument {:?} must be {}, got {}", name, want, got))
    }

    /// Fail unless the call carried no arguments; aggregates use this.
    pub fn ensure_empty(&self, function: &str) -> Result<()> {
        if self.args.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{} takes no arguments",
                function
            )))
        }
    }

    pub fn required_str(&self, name: &str) -> Result<&str> {
        match self.get(name) {
            Some(Arg::Value(Value::Str(s))) => Ok(s),
            Some(other) => Err(Self::mismatch(name, "a string", other)),
            None => Err(Self::missing(name)),
        }
    }

    pub fn optional_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            Some(Arg::Value(Value::Str(s))) => Ok(Some(s)),
            Some(other) => Err(Self::mismatch(name, "a string", other)),
            None => Ok(None),
        }
    }

    pub fn optional_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            Some(Arg::Value(Value::Bool(b))) => Ok(Some(*b)),
            Some(other) => Err(Self::mismatch(name, "a bool", other)),
            None => Ok(None),
        }
    }

    /// Times accept an explicit spec, a duration (relative to now) or an
    /// absolute timestamp.
    pub fn optional_time(&self, name: &str) -> Result<Option<TimeSpec>> {
        match self.get(name) {
            Some(Arg::Time(t)) => Ok(Some(*t)),
            Some(Arg::Value(Value::Duration(d))) => Ok(Some(TimeSpec::relative(*d))),
            Some(Arg::Value(Value::Time(t))) => Ok(Some(TimeSpec::absolute(*t))),
            Some(other) => Err(Self::mismatch(name, "a time", other)),
            None => Ok(None),
        }
    }

    pub fn required_time(&self, name: &str) -> Result<TimeSpec> {
        self.optional_time(name)?.ok_or_else(|| Self::missing(name))
    }

    pub fn optional_duration(&self, name: &str) -> Result<Option<Duration>> {
        match self.get(name) {
            Some(Arg::Value(Value::Duration(d))) => Ok(Some(*d)),
            Some(other) => Err(Self::mismatch(name, "a duration", other)),
            None => Ok(None),
        }
    }

    pub fn required_duration(&self, name: &str) -> Result<Duration> {
        self.optional_duration(name)?
            .ok_or_else(|| Self::missing(name))
    }

    pub fn required_expr(&self, name: &str) -> Result<&Expr> {
        match self.get(name) {
            Some(Arg::Expr(e)) => Ok(e),
            Some(other) => Err(Self::mismatch(name, "an expression", other)),
            None => Err(Self::missing(name)),
        }
    }

    pub fn optional_str_list(&self, name: &str) -> Result<Option<Vec<String>>> {
        match self.get(name) {
            Some(Arg::List(vs)) => {
                let mut out = Vec::with_capacity(vs.len());
                for v in vs {
                    match v {
                        Value::Str(s) => out.push(s.clone()),
                        other => {
                            return Err(Error::InvalidArgument(format!(
                                "argument {:?} must be a list of strings, found {}",
                                name,
                                other.type_name()
                            )))
                        }
                    }
                }
                Ok(Some(out))
            }
            Some(other) => Err(Self::mismatch(name, "a list of strings", other)),
            None => Ok(None),
        }
    }

    pub fn required_str_list(&self, name: &str) -> Result<Vec<String>> {
        self.optional_str_list(name)?
            .ok_or_else(|| Self::missing(name))
    }

    pub fn optional_map(&self, name: &str) -> Result<Option<&IndexMap<String, String>>> {
        match self.get(name) {
            Some(Arg::Map(m)) => Ok(Some(m)),
            Some(other) => Err(Self::mismatch(name, "a map", other)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_str() {
        let args = Arguments::new().with("db", Value::Str("mydb".into()));
        assert_eq!(args.required_str("db").unwrap(), "mydb");
        assert!(matches!(
            args.required_str("other"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_time_coercions() {
        let args = Arguments::new()
            .with("start", Value::Duration(Duration::from_secs(-3600)))
            .with("stop", Value::Time(virga_core::Time(42)));
        assert_eq!(
            args.required_time("start").unwrap(),
            TimeSpec::relative(Duration::from_secs(-3600))
        );
        assert_eq!(
            args.required_time("stop").unwrap(),
            TimeSpec::absolute(virga_core::Time(42))
        );
    }

    #[test]
    fn test_type_mismatch_names_argument() {
        let args = Arguments::new().with("timeout", Value::Str("1s".into()));
        let err = args.optional_duration("timeout").unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_ensure_empty() {
        assert!(Arguments::new().ensure_empty("sum").is_ok());
        let args = Arguments::new().with("x", Value::Int(1));
        assert!(args.ensure_empty("sum").is_err());
    }
}
