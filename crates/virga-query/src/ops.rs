//! Operation specs: the parse-time description of each query function
//!
//! `OpSpec` is a kind-tagged union covering the canonical VirgaQL functions.
//! Each variant parses itself out of [`Arguments`] and validates option
//! conflicts at parse time, before any planning happens.

use crate::arguments::Arguments;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use virga_core::{Duration, Error, Expr, Result, TimeSpec};

pub const SELECT_KIND: &str = "select";
pub const RANGE_KIND: &str = "range";
pub const FILTER_KIND: &str = "filter";
pub const WINDOW_KIND: &str = "window";
pub const SUM_KIND: &str = "sum";
pub const COUNT_KIND: &str = "count";
pub const MEAN_KIND: &str = "mean";
pub const MIN_KIND: &str = "min";
pub const MAX_KIND: &str = "max";
pub const STDDEV_KIND: &str = "stddev";
pub const JOIN_KIND: &str = "join";
pub const TO_HTTP_KIND: &str = "toHTTP";

/// Request timeout applied when `toHTTP` does not name one.
pub const DEFAULT_TO_HTTP_TIMEOUT: Duration = Duration(1_000_000_000);

/// User agent the `toHTTP` sink identifies as.
pub const DEFAULT_TO_HTTP_USER_AGENT: &str = "virgad/dev";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectSpec {
    pub database: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start: TimeSpec,
    pub stop: TimeSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub expression: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub start: TimeSpec,
    pub every: Duration,
    pub period: Duration,
    #[serde(default)]
    pub round: Duration,
    #[serde(default)]
    pub offset: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Ordered set of column labels the parents are grouped on.
    pub on: Vec<String>,
    pub eval: Expr,
    /// Parent op ID → identifier name bound in `eval`; the anonymous
    /// pipeline position is named `$`.
    #[serde(default)]
    pub tables: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToHttpSpec {
    pub addr: String,
    pub method: String,
    pub name: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub url_params: IndexMap<String, String>,
    pub timeout: Duration,
    #[serde(default)]
    pub no_keep_alive: bool,
    pub time_column: String,
    #[serde(default)]
    pub tag_columns: Vec<String>,
    pub value_columns: Vec<String>,
}

/// Parse-time description of one operation, tagged by its kind string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum OpSpec {
    #[serde(rename = "select")]
    Select(SelectSpec),
    #[serde(rename = "range")]
    Range(RangeSpec),
    #[serde(rename = "filter")]
    Filter(FilterSpec),
    #[serde(rename = "window")]
    Window(WindowSpec),
    #[serde(rename = "sum")]
    Sum,
    #[serde(rename = "count")]
    Count,
    #[serde(rename = "mean")]
    Mean,
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "stddev")]
    Stddev,
    #[serde(rename = "join")]
    Join(JoinSpec),
    #[serde(rename = "toHTTP")]
    ToHttp(ToHttpSpec),
}

impl OpSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            OpSpec::Select(_) => SELECT_KIND,
            OpSpec::Range(_) => RANGE_KIND,
            OpSpec::Filter(_) => FILTER_KIND,
            OpSpec::Window(_) => WINDOW_KIND,
            OpSpec::Sum => SUM_KIND,
            OpSpec::Count => COUNT_KIND,
            OpSpec::Mean => MEAN_KIND,
            OpSpec::Min => MIN_KIND,
            OpSpec::Max => MAX_KIND,
            OpSpec::Stddev => STDDEV_KIND,
            OpSpec::Join(_) => JOIN_KIND,
            OpSpec::ToHttp(_) => TO_HTTP_KIND,
        }
    }
}

impl SelectSpec {
    pub fn from_args(args: &Arguments) -> Result<OpSpec> {
        let database = args.required_str("db")?.to_string();
        if database.is_empty() {
            return Err(Error::invalid_argument("db must not be empty"));
        }
        Ok(OpSpec::Select(SelectSpec { database }))
    }
}

impl RangeSpec {
    pub fn from_args(args: &Arguments) -> Result<OpSpec> {
        let start = args.required_time("start")?;
        let stop = args.optional_time("stop")?.unwrap_or(TimeSpec::NOW);
        Ok(OpSpec::Range(RangeSpec { start, stop }))
    }
}

impl FilterSpec {
    pub fn from_args(args: &Arguments) -> Result<OpSpec> {
        let expression = args.required_expr("exp")?.clone();
        Ok(OpSpec::Filter(FilterSpec { expression }))
    }
}

impl WindowSpec {
    pub fn from_args(args: &Arguments) -> Result<OpSpec> {
        let start = args.required_time("start")?;
        let every = args.required_duration("every")?;
        if every.nanos() <= 0 {
            return Err(Error::invalid_argument("window every must be positive"));
        }
        let period = match args.optional_duration("period")? {
            Some(p) if p.nanos() <= 0 => {
                return Err(Error::invalid_argument("window period must be positive"))
            }
            Some(p) => p,
            None => every,
        };
        let round = args.optional_duration("round")?.unwrap_or(Duration::ZERO);
        if round.is_negative() {
            return Err(Error::invalid_argument("window round must not be negative"));
        }
        let offset = args.optional_duration("offset")?.unwrap_or(Duration::ZERO);
        Ok(OpSpec::Window(WindowSpec {
            start,
            every,
            period,
            round,
            offset,
        }))
    }
}

pub(crate) fn aggregate_from_args(
    args: &Arguments,
    kind: &'static str,
    spec: OpSpec,
) -> Result<OpSpec> {
    args.ensure_empty(kind)?;
    Ok(spec)
}

impl JoinSpec {
    pub fn from_args(args: &Arguments) -> Result<OpSpec> {
        let mut on = Vec::new();
        for label in args.required_str_list("on")? {
            // Ordered set: first occurrence wins.
            if !on.contains(&label) {
                on.push(label);
            }
        }
        if on.is_empty() {
            return Err(Error::invalid_argument("join requires at least one on column"));
        }
        let eval = args.required_expr("exp")?.clone();
        let tables = args.optional_map("tables")?.cloned().unwrap_or_default();
        Ok(OpSpec::Join(JoinSpec { on, eval, tables }))
    }

    /// The identifier name `eval` uses for the given parent op, `$` for the
    /// anonymous pipeline position.
    pub fn table_name(&self, op_id: &str) -> Option<&str> {
        self.tables.get(op_id).map(String::as_str)
    }
}

impl ToHttpSpec {
    pub fn from_args(args: &Arguments) -> Result<OpSpec> {
        let addr = args.required_str("addr")?.to_string();
        validate_addr(&addr)?;
        let name = args.required_str("name")?.to_string();

        let method = args
            .optional_str("method")?
            .unwrap_or("POST")
            .to_uppercase();

        let timeout = match args.optional_duration("timeout")? {
            Some(t) if t.is_negative() => {
                return Err(Error::invalid_argument("timeout must not be negative"))
            }
            // Zero means "use the default", not "expire immediately".
            Some(Duration::ZERO) | None => DEFAULT_TO_HTTP_TIMEOUT,
            Some(t) => t,
        };

        let time_column = args
            .optional_str("time_column")?
            .unwrap_or("_time")
            .to_string();

        let mut tag_columns = args.optional_str_list("tag_columns")?.unwrap_or_default();
        tag_columns.sort();
        tag_columns.dedup();

        let mut value_columns = args
            .optional_str_list("value_columns")?
            .filter(|cols| !cols.is_empty())
            .unwrap_or_else(|| vec!["_value".to_string()]);
        value_columns.sort();
        value_columns.dedup();

        let mut headers = IndexMap::new();
        headers.insert("Content-Type".to_string(), "application/vnd.virga".to_string());
        headers.insert("User-Agent".to_string(), DEFAULT_TO_HTTP_USER_AGENT.to_string());
        if let Some(extra) = args.optional_map("headers")? {
            for (k, v) in extra {
                headers.insert(k.clone(), v.clone());
            }
        }

        let url_params = args.optional_map("urlparams")?.cloned().unwrap_or_default();
        let no_keep_alive = args.optional_bool("nokeepalive")?.unwrap_or(false);

        Ok(OpSpec::ToHttp(ToHttpSpec {
            addr,
            method,
            name,
            headers,
            url_params,
            timeout,
            no_keep_alive,
            time_column,
            tag_columns,
            value_columns,
        }))
    }
}

fn validate_addr(addr: &str) -> Result<()> {
    let scheme = addr.split("://").next().unwrap_or("");
    if addr.contains("://") && scheme != "http" && scheme != "https" {
        return Err(Error::InvalidArgument(format!(
            "addr scheme must be http or https, got {:?}",
            scheme
        )));
    }
    Ok(())
}
