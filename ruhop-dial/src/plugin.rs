//! SIP003 plugin environment
//!
//! A shadowsocks client starts its plugin with the addresses in environment
//! variables: the plugin listens on `SS_LOCAL_HOST:SS_LOCAL_PORT` and relays
//! to `SS_REMOTE_HOST:SS_REMOTE_PORT`. `SS_PLUGIN_OPTIONS` carries extra
//! command line arguments, with `#SS_HOST`/`#SS_PORT` standing for the
//! remote address.

use std::ffi::OsString;

/// Addresses handed to the plugin by its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnv {
    pub local: String,
    pub remote: String,
}

impl PluginEnv {
    /// Read the plugin variables from the process environment
    pub fn from_env() -> (Option<Self>, Vec<String>) {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Plugin addresses, if the local address is set, and the extra arguments
    pub fn from_vars<F>(get: F) -> (Option<Self>, Vec<String>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| get(name).unwrap_or_default();
        let remote_host = var("SS_REMOTE_HOST");
        let remote_port = var("SS_REMOTE_PORT");

        let args = plugin_args(&var("SS_PLUGIN_OPTIONS"), &remote_host, &remote_port);

        let local_host = var("SS_LOCAL_HOST");
        let local_port = var("SS_LOCAL_PORT");
        if local_host.is_empty() || local_port.is_empty() {
            return (None, args);
        }

        let env = PluginEnv {
            local: join_host_port(&local_host, &local_port),
            remote: join_host_port(&remote_host, &remote_port),
        };
        (Some(env), args)
    }
}

/// Split plugin options into arguments
fn plugin_args(options: &str, remote_host: &str, remote_port: &str) -> Vec<String> {
    options
        .replace("#SS_HOST", remote_host)
        .replace("#SS_PORT", remote_port)
        .replace("\\=", "=")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// `host:port`, bracketing IPv6 literals
fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Command line with the plugin arguments appended
pub fn extend_args(args: impl IntoIterator<Item = OsString>, extra: Vec<String>) -> Vec<OsString> {
    args.into_iter()
        .chain(extra.into_iter().map(OsString::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_plugin_env() {
        let vars = [
            ("SS_LOCAL_HOST", "127.0.0.1"),
            ("SS_LOCAL_PORT", "1080"),
            ("SS_REMOTE_HOST", "203.0.113.7"),
            ("SS_REMOTE_PORT", "8388"),
            ("SS_PLUGIN_OPTIONS", "-V  --protect-path\\=/data/protect_path"),
        ];

        let (env, args) = PluginEnv::from_vars(lookup(&vars));
        assert_eq!(
            env,
            Some(PluginEnv {
                local: "127.0.0.1:1080".into(),
                remote: "203.0.113.7:8388".into(),
            })
        );
        assert_eq!(args, vec!["-V", "--protect-path=/data/protect_path"]);
    }

    #[test]
    fn test_remote_placeholders() {
        assert_eq!(
            plugin_args("-V -c /etc/ruhop-dial/#SS_HOST-#SS_PORT.toml", "203.0.113.7", "443"),
            vec!["-V", "-c", "/etc/ruhop-dial/203.0.113.7-443.toml"]
        );
    }

    #[test]
    fn test_not_a_plugin() {
        let (env, args) = PluginEnv::from_vars(lookup(&[("SS_REMOTE_HOST", "1.2.3.4")]));
        assert!(env.is_none());
        assert!(args.is_empty());
    }

    #[test]
    fn test_ipv6_local_host() {
        let vars = [
            ("SS_LOCAL_HOST", "::1"),
            ("SS_LOCAL_PORT", "1080"),
            ("SS_REMOTE_HOST", "2001:db8::1"),
            ("SS_REMOTE_PORT", "8388"),
        ];
        let (env, _) = PluginEnv::from_vars(lookup(&vars));
        let env = env.unwrap();
        assert_eq!(env.local, "[::1]:1080");
        assert_eq!(env.remote, "[2001:db8::1]:8388");
    }

    #[test]
    fn test_extend_args() {
        let args = extend_args(vec![OsString::from("ruhop-dial")], vec!["-D".into()]);
        assert_eq!(args, vec![OsString::from("ruhop-dial"), OsString::from("-D")]);
    }
}
