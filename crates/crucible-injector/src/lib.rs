// Builds the environment variable set for a container run, and strips
// ANSI escapes from raw log chunks before they hit the buffer.

use std::collections::HashMap;

/// Host environment variables made available to a container beyond the
/// caller's own `config.envVars`, when the caller did not already set
/// that key.
pub const HOST_ENV_ALLOW_LIST: &[&str] = &[
    "API_USER",
    "API_PASSWORD",
    "BASE_URL",
    "SECRET_KEY",
    "DB_USER",
    "DB_PASS",
    "MONGO_URI",
    "MONGODB_URL",
    "REDIS_URL",
    "GEMINI_API_KEY",
];

/// Keys eligible for the host-gateway URL rewrite.
const HOST_REWRITE_KEYS: &[&str] = &["BASE_URL", "MONGO_URI", "MONGODB_URL"];

/// Conventional Docker host-gateway alias.
pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";

/// Builds the final environment map for a container run.
///
/// `task_id` and `resolved_base_url` seed the base set; `caller_env_vars`
/// overlays as-is; `host_env` supplies values for the allow-list (called
/// once per allow-listed key, skipped for keys the caller already set).
pub fn build_environment<F>(
    task_id: &str,
    resolved_base_url: &str,
    caller_env_vars: Option<&HashMap<String, String>>,
    host_env: F,
) -> HashMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = HashMap::new();
    env.insert("BASE_URL".to_string(), resolved_base_url.to_string());
    env.insert("TASK_ID".to_string(), task_id.to_string());
    env.insert("CI".to_string(), "true".to_string());
    env.insert("FRAMEWORK_AGNOSTIC".to_string(), "true".to_string());

    if let Some(caller_env_vars) = caller_env_vars {
        for (key, value) in caller_env_vars {
            env.insert(key.clone(), value.clone());
        }
    }

    for &key in HOST_ENV_ALLOW_LIST {
        if env.contains_key(key) {
            continue;
        }
        if let Some(value) = host_env(key) {
            env.insert(key.to_string(), value);
        }
    }

    for &key in HOST_REWRITE_KEYS {
        if let Some(value) = env.get(key) {
            if let Some(rewritten) = rewrite_host_local(value) {
                env.insert(key.to_string(), rewritten);
            }
        }
    }

    env
}

/// Substitutes `localhost`/`127.0.0.1` with [`HOST_GATEWAY_ALIAS`] in a
/// URL-shaped value. Returns `None` when no rewrite is needed.
fn rewrite_host_local(value: &str) -> Option<String> {
    if value.contains("localhost") {
        Some(value.replace("localhost", HOST_GATEWAY_ALIAS))
    } else if value.contains("127.0.0.1") {
        Some(value.replace("127.0.0.1", HOST_GATEWAY_ALIAS))
    } else {
        None
    }
}

/// Strips ANSI escape sequences from a raw log chunk, matching the
/// Worker's "accumulated de-ANSI-stripped log text" invariant on
/// `Execution.output`.
pub fn strip_ansi(chunk: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(chunk);
    String::from_utf8_lossy(&stripped).into_owned()
}
