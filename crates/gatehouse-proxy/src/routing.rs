//! Cluster-identifier extraction and startup-message rewriting.
//!
//! A cluster identifier is `<cluster name>-<tenant id>`. The tenant id is
//! always at the end, but the cluster name can itself contain `-` or
//! digits: in "foo-7-10" the cluster name is "foo-7" and the tenant id is
//! 10. Clients may place the identifier in the `database` parameter
//! ("happy-koala-3.defaultdb") or in the `options` parameter
//! ("--cluster=happy-koala-3"), using any of the three libpq forms
//! `-c NAME=VALUE`, `-cNAME=VALUE`, and `--NAME=VALUE`.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::admit::StartupMessage;
use crate::errors::{ErrorCode, ProxyError, ProxyResult};

// Whitespace separates command-line args; escaping rules are not handled.
static CLUSTER_FLAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:-c\s*|--)cluster=(\S*)").unwrap());

// Cluster names have 6 to 20 alphanumeric characters, with dashes allowed
// within the name but not as a first or last character.
static CLUSTER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9][a-z0-9-]{4,18}[a-z0-9]$").unwrap());

const CLUSTER_TENANT_SEP: char = '-';

/// Startup parameter carrying the client's address to the backend.
pub const REMOTE_ADDR_PARAM: &str = "crdb:remote_addr";

const CLUSTER_IDENTIFIER_HINT: &str = "Ensure that your cluster identifier is uniquely specified using any of the
following methods:

1) Database parameter:
   Use \"<cluster identifier>.<database name>\" as the database parameter.
   (e.g. database=\"active-roach-42.defaultdb\")

2) Options parameter:
   Use \"--cluster=<cluster identifier>\" as the options parameter.
   (e.g. options=\"--cluster=active-roach-42\")
";

const CLUSTER_NAME_FORM_HINT: &str =
    "Cluster identifiers come in the form of <name>-<tenant ID> (e.g. lazy-roach-3).";

const MISSING_TENANT_ID_HINT: &str =
    "Did you forget to include your tenant ID in the cluster identifier?";

/// A tenant identifier. Values 0 and 1 are reserved for the system tenant
/// and are rejected at the parse edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TenantId(u64);

impl TenantId {
    pub const MIN: u64 = 2;

    pub fn new(raw: u64) -> Option<Self> {
        if raw < Self::MIN {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Extract the cluster name and tenant id from the startup parameters and
/// build the rewritten message that is forwarded to the backend: the
/// cluster prefix is stripped from `database`, the cluster flag is removed
/// from `options` (the entry dropped if it becomes empty), and the
/// client's address is attached as `crdb:remote_addr`.
///
/// Errors returned here are user-facing.
pub fn cluster_and_tenant(
    msg: &StartupMessage,
    client_addr: SocketAddr,
) -> ProxyResult<(StartupMessage, String, TenantId)> {
    let database_param = msg.parameters.get("database").map(String::as_str);
    let options_param = msg.parameters.get("options").map(String::as_str);

    let (ident_from_db, database_name) = parse_database_param(database_param)?;
    let (ident_from_opt, new_options) = parse_options_param(options_param)?;

    let identifier: String = match (ident_from_db, ident_from_opt) {
        (None, None) => {
            return Err(routing_err("missing cluster identifier")
                .with_hint(CLUSTER_IDENTIFIER_HINT));
        }
        (Some(db), Some(opt)) if db != opt => {
            return Err(
                routing_err("multiple different cluster identifiers provided").with_hint(format!(
                    "Is '{}' or '{}' the identifier for the cluster that you're connecting to?\n{}",
                    db, opt, CLUSTER_IDENTIFIER_HINT
                )),
            );
        }
        (Some(db), _) => db.to_string(),
        (None, Some(opt)) => opt,
    };

    // The tenant id is the substring after the last separator.
    let Some(sep_idx) = identifier.rfind(CLUSTER_TENANT_SEP) else {
        return Err(
            routing_err(format!("invalid cluster identifier '{}'", identifier)).with_hint(
                format!("{}\n{}", MISSING_TENANT_ID_HINT, CLUSTER_NAME_FORM_HINT),
            ),
        );
    };
    let (cluster_name, tenant_str) = (&identifier[..sep_idx], &identifier[sep_idx + 1..]);
    if tenant_str.is_empty() {
        return Err(
            routing_err(format!("invalid cluster identifier '{}'", identifier)).with_hint(
                format!("{}\n{}", MISSING_TENANT_ID_HINT, CLUSTER_NAME_FORM_HINT),
            ),
        );
    }

    if !CLUSTER_NAME_RE.is_match(cluster_name) {
        return Err(
            routing_err(format!("invalid cluster identifier '{}'", identifier)).with_hint(
                format!(
                    "Is '{}' a valid cluster name?\n{}",
                    cluster_name, CLUSTER_NAME_FORM_HINT
                ),
            ),
        );
    }

    let raw_tenant: u64 = tenant_str.parse().map_err(|_| {
        routing_err(format!("invalid cluster identifier '{}'", identifier)).with_hint(format!(
            "Is '{}' a valid tenant ID?\n{}",
            tenant_str, CLUSTER_NAME_FORM_HINT
        ))
    })?;

    let Some(tenant_id) = TenantId::new(raw_tenant) else {
        return Err(
            routing_err(format!("invalid cluster identifier '{}'", identifier))
                .with_hint(format!("Tenant ID {} is invalid.", raw_tenant)),
        );
    };

    // Build a fresh parameter map; the original message is never forwarded.
    let mut parameters = HashMap::with_capacity(msg.parameters.len() + 1);
    for (key, value) in &msg.parameters {
        match key.as_str() {
            "database" => {
                parameters.insert(key.clone(), database_name.to_string());
            }
            "options" => {
                if !new_options.is_empty() {
                    parameters.insert(key.clone(), new_options.clone());
                }
            }
            _ => {
                parameters.insert(key.clone(), value.clone());
            }
        }
    }
    parameters.insert(REMOTE_ADDR_PARAM.to_string(), client_addr.to_string());

    let out = StartupMessage {
        protocol_version: msg.protocol_version,
        parameters,
    };
    Ok((out, cluster_name.to_string(), tenant_id))
}

/// Split the cluster identifier out of the `database` parameter. The
/// identifier is embedded with a dot ("<cluster identifier>.<database
/// name>"), which is safe because dots are not allowed in database names.
fn parse_database_param(param: Option<&str>) -> ProxyResult<(Option<&str>, &str)> {
    let Some(param) = param else {
        return Ok((None, ""));
    };
    if param.is_empty() {
        return Ok((None, ""));
    }

    let parts: Vec<&str> = param.split('.').collect();
    if parts.len() <= 1 {
        return Ok((None, param));
    }
    if parts.len() > 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(routing_err("invalid database param").with_hint(CLUSTER_IDENTIFIER_HINT));
    }
    Ok((Some(parts[0]), parts[1]))
}

/// Scan the `options` parameter for a cluster flag and return the
/// identifier along with the options string with the flag stripped out.
/// The scan is capped at two matches: two or more cluster flags are
/// refused rather than deduplicated.
fn parse_options_param(param: Option<&str>) -> ProxyResult<(Option<String>, String)> {
    let Some(param) = param else {
        return Ok((None, String::new()));
    };
    if param.is_empty() {
        return Ok((None, String::new()));
    }

    let mut captures = CLUSTER_FLAG_RE.captures_iter(param).take(2);
    let Some(first) = captures.next() else {
        return Ok((None, param.to_string()));
    };
    if captures.next().is_some() {
        return Err(routing_err("multiple cluster flags provided").with_hint(CLUSTER_IDENTIFIER_HINT));
    }

    let identifier = first.get(1).map(|m| m.as_str()).unwrap_or("");
    if identifier.is_empty() {
        return Err(routing_err("invalid cluster flag").with_hint(CLUSTER_IDENTIFIER_HINT));
    }

    let full_match = first.get(0).map(|m| m.as_str()).unwrap_or("");
    let stripped = param.replace(full_match, "");
    Ok((Some(identifier.to_string()), stripped.trim().to_string()))
}

fn routing_err(message: impl Into<String>) -> ProxyError {
    ProxyError::new(ErrorCode::ParamsRoutingFailed, message)
}
