//! Static route table and path matching.
//!
//! Routes are declared once at startup and never change. Resolution tries an
//! exact literal match first, then parameterized patterns ordered from most to
//! least specific:
//! 1. patterns without a trailing catch-all before those with one
//! 2. fewer `:param` segments
//! 3. longer literal prefix
//! 4. declaration order

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default API version prefix stripped from inbound paths.
pub const DEFAULT_API_PREFIX: &str = "/api/v1";

/// Downstream services the gateway proxies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    User,
    Order,
    Inventory,
    Insights,
}

impl Backend {
    pub const ALL: [Backend; 4] = [
        Backend::User,
        Backend::Order,
        Backend::Inventory,
        Backend::Insights,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::User => "user",
            Backend::Order => "order",
            Backend::Inventory => "inventory",
            Backend::Insights => "insights",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = RouteTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "users" => Ok(Backend::User),
            "order" | "orders" => Ok(Backend::Order),
            "inventory" => Ok(Backend::Inventory),
            "insights" => Ok(Backend::Insights),
            other => Err(RouteTableError::UnknownBackend(other.to_string())),
        }
    }
}

/// One logical endpoint pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Pattern relative to the API prefix, e.g. `/assets/:asset_id/balance`.
    pub path_pattern: String,
    pub target: Backend,
    pub requires_auth: bool,
    /// Empty means any principal (subject to `requires_auth`).
    pub allowed_roles: BTreeSet<String>,
    /// Upper-case HTTP methods. Empty means any method.
    pub methods: BTreeSet<String>,
    /// Backend 401s on this route count as failed logins for the caller's IP.
    pub is_login: bool,
}

impl RouteConfig {
    pub fn new(path_pattern: &str, target: Backend) -> Self {
        Self {
            path_pattern: path_pattern.to_string(),
            target,
            requires_auth: false,
            allowed_roles: BTreeSet::new(),
            methods: BTreeSet::new(),
            is_login: false,
        }
    }

    pub fn method(mut self, method: &str) -> Self {
        self.methods.insert(method.to_ascii_uppercase());
        self
    }

    pub fn authenticated(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.allowed_roles
            .extend(roles.iter().map(|r| r.to_string()));
        self
    }

    pub fn login(mut self) -> Self {
        self.is_login = true;
        self
    }

    fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(&method.to_ascii_uppercase())
    }
}

/// Route table construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteTableError {
    #[error("Route pattern must start with '/': {0}")]
    NotAbsolute(String),
    #[error("Empty parameter name in pattern: {0}")]
    EmptyParam(String),
    #[error("Catch-all segment must be last: {0}")]
    CatchAllNotLast(String),
    #[error("Ambiguous routes: {0} and {1}")]
    Ambiguous(String, String),
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    #[error("API prefix must start with '/' and not end with '/': {0}")]
    InvalidPrefix(String),
}

/// Path did not match any route.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("No route for {method} {path}")]
pub struct RouteNotFound {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    CatchAll(String),
}

impl Segment {
    fn parse(raw: &str, pattern: &str) -> Result<Self, RouteTableError> {
        if let Some(name) = raw.strip_prefix(':') {
            if name.is_empty() {
                return Err(RouteTableError::EmptyParam(pattern.to_string()));
            }
            Ok(Segment::Param(name.to_string()))
        } else if let Some(name) = raw.strip_prefix('*') {
            if name.is_empty() {
                return Err(RouteTableError::EmptyParam(pattern.to_string()));
            }
            Ok(Segment::CatchAll(name.to_string()))
        } else {
            Ok(Segment::Literal(raw.to_string()))
        }
    }

    /// Shape used for ambiguity checks: parameter names do not matter.
    fn shape(&self) -> &str {
        match self {
            Segment::Literal(s) => s,
            Segment::Param(_) => ":",
            Segment::CatchAll(_) => "*",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Specificity {
    has_catch_all: bool,
    wildcards: usize,
    /// Stored negated so that a longer prefix sorts first.
    neg_literal_prefix: isize,
    index: usize,
}

#[derive(Debug)]
struct CompiledRoute {
    config: RouteConfig,
    segments: Vec<Segment>,
    specificity: Specificity,
}

impl CompiledRoute {
    fn compile(config: RouteConfig, index: usize) -> Result<Self, RouteTableError> {
        let pattern = config.path_pattern.clone();
        if !pattern.starts_with('/') {
            return Err(RouteTableError::NotAbsolute(pattern));
        }

        let segments = split_segments(&pattern)
            .into_iter()
            .map(|s| Segment::parse(s, &pattern))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(pos) = segments
            .iter()
            .position(|s| matches!(s, Segment::CatchAll(_)))
        {
            if pos != segments.len() - 1 {
                return Err(RouteTableError::CatchAllNotLast(pattern));
            }
        }

        let wildcards = segments
            .iter()
            .filter(|s| !matches!(s, Segment::Literal(_)))
            .count();
        let literal_prefix = segments
            .iter()
            .take_while(|s| matches!(s, Segment::Literal(_)))
            .count();

        let specificity = Specificity {
            has_catch_all: matches!(segments.last(), Some(Segment::CatchAll(_))),
            wildcards,
            neg_literal_prefix: -(literal_prefix as isize),
            index,
        };

        Ok(Self {
            config,
            segments,
            specificity,
        })
    }

    fn is_literal(&self) -> bool {
        self.specificity.wildcards == 0
    }

    fn shape(&self) -> String {
        self.segments
            .iter()
            .map(Segment::shape)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Match path segments, returning captured parameters.
    fn matches(&self, path: &[&str]) -> Option<Vec<(String, String)>> {
        let mut params = Vec::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(lit) => {
                    if path.get(i) != Some(&lit.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = path.get(i).filter(|v| !v.is_empty())?;
                    params.push((name.clone(), value.to_string()));
                }
                Segment::CatchAll(name) => {
                    let rest = path.get(i..).filter(|r| !r.is_empty())?;
                    if rest.iter().all(|s| s.is_empty()) {
                        return None;
                    }
                    params.push((name.clone(), rest.join("/")));
                    return Some(params);
                }
            }
        }

        (path.len() == self.segments.len()).then_some(params)
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a RouteConfig,
    /// Inbound path with the API prefix removed, forwarded to the backend.
    pub target_path: String,
    pub params: Vec<(String, String)>,
}

impl RouteMatch<'_> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Immutable route table.
#[derive(Debug)]
pub struct RouteTable {
    prefix: String,
    /// Literal-only routes keyed by normalized pattern.
    literal: HashMap<String, Vec<usize>>,
    /// All routes, sorted by specificity.
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Build a table; fails if any pattern is invalid or two routes could
    /// match the same request with equal specificity.
    pub fn new(prefix: &str, routes: Vec<RouteConfig>) -> Result<Self, RouteTableError> {
        if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
            return Err(RouteTableError::InvalidPrefix(prefix.to_string()));
        }

        let mut compiled = routes
            .into_iter()
            .enumerate()
            .map(|(i, r)| CompiledRoute::compile(r, i))
            .collect::<Result<Vec<_>, _>>()?;

        check_ambiguity(&compiled)?;

        compiled.sort_by_key(|r| r.specificity);

        let mut literal: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, route) in compiled.iter().enumerate() {
            if route.is_literal() {
                literal
                    .entry(normalize(&route.config.path_pattern))
                    .or_default()
                    .push(i);
            }
        }

        Ok(Self {
            prefix: prefix.to_string(),
            literal,
            routes: compiled,
        })
    }

    /// The table the gateway ships with.
    pub fn with_defaults(prefix: &str) -> Result<Self, RouteTableError> {
        Self::new(prefix, default_routes())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteConfig> {
        self.routes.iter().map(|r| &r.config)
    }

    /// Strip the API prefix; `None` if the path is outside the API.
    pub fn strip_prefix<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Resolve an inbound path (including the API prefix) and method.
    pub fn resolve(&self, path: &str, method: &str) -> Result<RouteMatch<'_>, RouteNotFound> {
        let not_found = || RouteNotFound {
            method: method.to_string(),
            path: path.to_string(),
        };

        let target_path = self.strip_prefix(path).ok_or_else(not_found)?;
        if has_dot_segment(target_path) {
            return Err(not_found());
        }
        let normalized = normalize(target_path);

        if let Some(indices) = self.literal.get(&normalized) {
            if let Some(route) = indices
                .iter()
                .map(|&i| &self.routes[i])
                .find(|r| r.config.allows_method(method))
            {
                return Ok(RouteMatch {
                    route: &route.config,
                    target_path: target_path.to_string(),
                    params: Vec::new(),
                });
            }
        }

        let segments = split_segments(&normalized);
        self.routes
            .iter()
            .filter(|r| !r.is_literal() && r.config.allows_method(method))
            .find_map(|r| {
                r.matches(&segments).map(|params| RouteMatch {
                    route: &r.config,
                    target_path: target_path.to_string(),
                    params,
                })
            })
            .ok_or_else(not_found)
    }

    /// The pattern (with prefix) a concrete path belongs to, ignoring method.
    ///
    /// Idempotent: `base_path(base_path(p)) == base_path(p)`.
    pub fn base_path(&self, path: &str) -> Option<String> {
        let target_path = self.strip_prefix(path)?;
        if has_dot_segment(target_path) {
            return None;
        }
        let normalized = normalize(target_path);

        let route = match self.literal.get(&normalized) {
            Some(indices) => indices.first().map(|&i| &self.routes[i]),
            None => {
                let segments = split_segments(&normalized);
                self.routes
                    .iter()
                    .filter(|r| !r.is_literal())
                    .find(|r| r.matches(&segments).is_some())
            }
        }?;

        Some(format!("{}{}", self.prefix, route.config.path_pattern))
    }
}

fn check_ambiguity(routes: &[CompiledRoute]) -> Result<(), RouteTableError> {
    for (i, a) in routes.iter().enumerate() {
        for b in &routes[i + 1..] {
            let methods_overlap = a.config.methods.is_empty()
                || b.config.methods.is_empty()
                || !a.config.methods.is_disjoint(&b.config.methods);
            if methods_overlap && a.shape() == b.shape() {
                return Err(RouteTableError::Ambiguous(
                    a.config.path_pattern.clone(),
                    b.config.path_pattern.clone(),
                ));
            }
        }
    }
    Ok(())
}

/// Whether a path contains a `.` or `..` segment, in plain or
/// percent-encoded form, or a backslash.
///
/// URL parsers resolve these before the request reaches a backend, so a path
/// containing one would not reach the backend as the route that matched it.
pub fn has_dot_segment(path: &str) -> bool {
    if path.contains('\\') {
        return true;
    }
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Drop a trailing slash (except for the root path).
fn normalize(path: &str) -> String {
    if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

/// The shipped route set.
pub fn default_routes() -> Vec<RouteConfig> {
    use Backend::*;

    const TRADERS: &[&str] = &["customer", "admin"];
    const ADMINS: &[&str] = &["admin"];

    vec![
        // auth
        RouteConfig::new("/auth/login", User).method("POST").login(),
        RouteConfig::new("/auth/register", User).method("POST"),
        RouteConfig::new("/auth/refresh", User).method("POST"),
        RouteConfig::new("/auth/logout", User).method("POST").authenticated(),
        // users
        RouteConfig::new("/users/me", User).method("GET").authenticated(),
        RouteConfig::new("/users/me", User).method("PUT").authenticated(),
        RouteConfig::new("/users", User).method("GET").authenticated().roles(ADMINS),
        RouteConfig::new("/portfolio/:username", User)
            .method("GET")
            .authenticated()
            .roles(TRADERS),
        // assets
        RouteConfig::new("/assets", User).method("GET").authenticated(),
        RouteConfig::new("/assets/:asset_id/balance", User)
            .method("GET")
            .authenticated()
            .roles(TRADERS),
        RouteConfig::new("/assets/:asset_id/transactions", User)
            .method("GET")
            .authenticated()
            .roles(TRADERS),
        // orders
        RouteConfig::new("/orders", Order).method("POST").authenticated().roles(TRADERS),
        RouteConfig::new("/orders", Order).method("GET").authenticated(),
        RouteConfig::new("/orders/:order_id", Order).method("GET").authenticated(),
        RouteConfig::new("/orders/:order_id", Order)
            .method("DELETE")
            .authenticated()
            .roles(TRADERS),
        // inventory
        RouteConfig::new("/inventory/assets", Inventory).method("GET"),
        RouteConfig::new("/inventory/assets/:asset_id", Inventory).method("GET"),
        RouteConfig::new("/inventory/assets", Inventory)
            .method("POST")
            .authenticated()
            .roles(ADMINS),
        RouteConfig::new("/inventory/assets/:asset_id", Inventory)
            .method("PUT")
            .authenticated()
            .roles(ADMINS),
        // insights
        RouteConfig::new("/insights/*rest", Insights).method("GET"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::with_defaults(DEFAULT_API_PREFIX).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let t = table();
        let m = t.resolve("/api/v1/auth/login", "POST").unwrap();
        assert_eq!(m.route.path_pattern, "/auth/login");
        assert!(m.route.is_login);
        assert_eq!(m.target_path, "/auth/login");
    }

    #[test]
    fn test_parameterized_family_is_stable() {
        let t = table();
        let btc = t.resolve("/api/v1/assets/BTC/balance", "GET").unwrap();
        let eth = t.resolve("/api/v1/assets/ETH/balance", "GET").unwrap();

        assert_eq!(btc.route, eth.route);
        assert_eq!(btc.route.path_pattern, "/assets/:asset_id/balance");
        assert_eq!(btc.param("asset_id"), Some("BTC"));
        assert_eq!(eth.target_path, "/assets/ETH/balance");

        let tx = t.resolve("/api/v1/assets/ETH/transactions", "GET").unwrap();
        assert_eq!(tx.route.path_pattern, "/assets/:asset_id/transactions");
        assert_ne!(tx.route, btc.route);
    }

    #[test]
    fn test_known_families() {
        let t = table();
        let cases = [
            ("/api/v1/orders/ord-17", "GET", "/orders/:order_id"),
            ("/api/v1/orders/ord-17", "DELETE", "/orders/:order_id"),
            ("/api/v1/portfolio/alice", "GET", "/portfolio/:username"),
            ("/api/v1/inventory/assets/SOL", "GET", "/inventory/assets/:asset_id"),
            ("/api/v1/inventory/assets", "GET", "/inventory/assets"),
            ("/api/v1/insights/market/summary", "GET", "/insights/*rest"),
        ];
        for (path, method, pattern) in cases {
            let m = t.resolve(path, method).unwrap();
            assert_eq!(m.route.path_pattern, pattern, "{method} {path}");
        }
    }

    #[test]
    fn test_method_selects_route() {
        let t = table();
        let get = t.resolve("/api/v1/orders/1", "GET").unwrap();
        let delete = t.resolve("/api/v1/orders/1", "DELETE").unwrap();
        assert!(get.route.allowed_roles.is_empty());
        assert!(delete.route.allowed_roles.contains("customer"));
        assert!(t.resolve("/api/v1/orders/1", "PATCH").is_err());
    }

    #[test]
    fn test_specific_beats_catch_all() {
        let routes = vec![
            RouteConfig::new("/assets/*rest", Backend::Insights),
            RouteConfig::new("/assets/:asset_id", Backend::Inventory),
            RouteConfig::new("/assets/:asset_id/balance", Backend::User),
        ];
        let t = RouteTable::new("/api/v1", routes).unwrap();

        let m = t.resolve("/api/v1/assets/BTC/balance", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/assets/:asset_id/balance");

        let m = t.resolve("/api/v1/assets/BTC", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/assets/:asset_id");

        let m = t.resolve("/api/v1/assets/BTC/history/2024", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/assets/*rest");
        assert_eq!(m.param("rest"), Some("BTC/history/2024"));
    }

    #[test]
    fn test_fewer_wildcards_then_longer_prefix() {
        let routes = vec![
            RouteConfig::new("/:a/:b/balance", Backend::Order),
            RouteConfig::new("/:a/x/:c", Backend::Inventory),
            RouteConfig::new("/assets/:b/:c", Backend::User),
        ];
        let t = RouteTable::new("", routes).unwrap();

        // All three have two wildcards; the longest literal prefix wins.
        let m = t.resolve("/assets/x/balance", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/assets/:b/:c");

        let routes = vec![
            RouteConfig::new("/:a/:b/:c", Backend::Order),
            RouteConfig::new("/:a/x/balance", Backend::User),
        ];
        let t = RouteTable::new("", routes).unwrap();
        let m = t.resolve("/assets/x/balance", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/:a/x/balance");
    }

    #[test]
    fn test_literal_beats_param() {
        let routes = vec![
            RouteConfig::new("/orders/:order_id", Backend::Order),
            RouteConfig::new("/orders/history", Backend::Insights),
        ];
        let t = RouteTable::new("/api/v1", routes).unwrap();
        let m = t.resolve("/api/v1/orders/history", "GET").unwrap();
        assert_eq!(m.route.target, Backend::Insights);
    }

    #[test]
    fn test_not_found() {
        let t = table();
        assert!(t.resolve("/api/v1/unknown", "GET").is_err());
        assert!(t.resolve("/api/v2/orders", "GET").is_err());
        assert!(t.resolve("/orders", "GET").is_err());
        assert!(t.resolve("/api/v1orders", "GET").is_err());
        // Empty segments never satisfy a parameter.
        assert!(t.resolve("/api/v1/assets//balance", "GET").is_err());
        // A bare catch-all root needs at least one segment.
        assert!(t.resolve("/api/v1/insights", "GET").is_err());
    }

    #[test]
    fn test_trailing_slash() {
        let t = table();
        let m = t.resolve("/api/v1/orders/", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/orders");
        assert_eq!(m.target_path, "/orders/");
    }

    #[test]
    fn test_base_path_idempotent() {
        let t = table();
        let paths = [
            "/api/v1/assets/BTC/balance",
            "/api/v1/orders/abc",
            "/api/v1/portfolio/alice",
            "/api/v1/inventory/assets/ETH",
            "/api/v1/insights/a/b/c",
            "/api/v1/auth/login",
        ];
        for p in paths {
            let once = t.base_path(p).unwrap();
            let twice = t.base_path(&once).unwrap();
            assert_eq!(once, twice, "{p}");
        }
        assert_eq!(
            t.base_path("/api/v1/assets/BTC/balance").unwrap(),
            "/api/v1/assets/:asset_id/balance"
        );

        for route in t.routes() {
            let pattern = format!("{}{}", t.prefix(), route.path_pattern);
            assert_eq!(t.base_path(&pattern).unwrap(), pattern);
        }
    }

    #[test]
    fn test_ambiguous_routes_rejected() {
        let routes = vec![
            RouteConfig::new("/orders/:id", Backend::Order),
            RouteConfig::new("/orders/:order_id", Backend::Order),
        ];
        assert!(matches!(
            RouteTable::new("/api/v1", routes),
            Err(RouteTableError::Ambiguous(_, _))
        ));

        // Same shape with disjoint methods is fine.
        let routes = vec![
            RouteConfig::new("/orders/:id", Backend::Order).method("GET"),
            RouteConfig::new("/orders/:order_id", Backend::Order).method("DELETE"),
        ];
        assert!(RouteTable::new("/api/v1", routes).is_ok());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            RouteTable::new("", vec![RouteConfig::new("orders", Backend::Order)]),
            Err(RouteTableError::NotAbsolute(_))
        ));
        assert!(matches!(
            RouteTable::new("", vec![RouteConfig::new("/orders/:", Backend::Order)]),
            Err(RouteTableError::EmptyParam(_))
        ));
        assert!(matches!(
            RouteTable::new("", vec![RouteConfig::new("/a/*rest/b", Backend::Order)]),
            Err(RouteTableError::CatchAllNotLast(_))
        ));
        assert!(matches!(
            RouteTable::new("/api/v1/", vec![]),
            Err(RouteTableError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_dot_segments_never_match() {
        let table = RouteTable::with_defaults("/api/v1").unwrap();

        for path in [
            "/api/v1/insights/../orders/42",
            "/api/v1/insights/%2e%2e/orders/42",
            "/api/v1/insights/%2E./orders/42",
            "/api/v1/insights/./summary",
            "/api/v1/insights/..\\orders/42",
        ] {
            assert!(has_dot_segment(path), "{path}");
            assert!(table.resolve(path, "GET").is_err(), "{path}");
            assert!(table.base_path(path).is_none(), "{path}");
        }

        // Dots inside a segment are ordinary characters.
        assert!(!has_dot_segment("/api/v1/inventory/assets/a..b"));
        assert!(!has_dot_segment("/api/v1/users/me.json"));
        assert!(!has_dot_segment("/api/v1/orders/..."));
    }

    #[test]
    fn test_equal_specificity_uses_declaration_order() {
        // Different shapes that both match `/a/x/y`; neither is more
        // specific, so the first declared wins.
        let routes = vec![
            RouteConfig::new("/:a/x/:c", Backend::Order),
            RouteConfig::new("/:a/:b/y", Backend::Inventory),
        ];
        let table = RouteTable::new("", routes).unwrap();
        let m = table.resolve("/a/x/y", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/:a/x/:c");
        assert_eq!(table.base_path("/a/x/y").as_deref(), Some("/:a/x/:c"));

        let routes = vec![
            RouteConfig::new("/:a/:b/y", Backend::Inventory),
            RouteConfig::new("/:a/x/:c", Backend::Order),
        ];
        let table = RouteTable::new("", routes).unwrap();
        let m = table.resolve("/a/x/y", "GET").unwrap();
        assert_eq!(m.route.path_pattern, "/:a/:b/y");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("user".parse::<Backend>().unwrap(), Backend::User);
        assert_eq!("Orders".parse::<Backend>().unwrap(), Backend::Order);
        assert!("billing".parse::<Backend>().is_err());
    }
}
