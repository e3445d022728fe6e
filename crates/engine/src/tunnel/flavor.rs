//! Per-vendor tunnel binaries: flags, downloads and stdout markers

use crate::config::Credentials;
use crossrun_common::{TunnelOptions, Vendor};

/// What a line of tunnel output tells us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Ready,
    AuthFailure,
    Graceful,
    Transient,
    Other,
}

/// Static description of one vendor's tunnel executable
#[derive(Debug)]
pub struct TunnelFlavor {
    pub vendor: Vendor,
    /// Executable name without platform suffix
    pub binary_name: &'static str,
    pub user_flag: Option<&'static str>,
    pub key_flag: &'static str,
    pub identifier_flag: &'static str,
    pub log_file_flag: Option<&'static str>,
    pub pid_file_flag: Option<&'static str>,
    pub proxy_port_flag: Option<&'static str>,
    pub selenium_port_flag: Option<&'static str>,
    ready: &'static [&'static str],
    auth_failure: &'static [&'static str],
    graceful: &'static [&'static str],
    transient: &'static [&'static str],
    downloads: Downloads,
}

#[derive(Debug)]
struct Downloads {
    linux: &'static str,
    macos: &'static str,
    windows: &'static str,
}

static BROWSERSTACK: TunnelFlavor = TunnelFlavor {
    vendor: Vendor::BrowserStack,
    binary_name: "BrowserStackLocal",
    user_flag: None,
    key_flag: "--key",
    identifier_flag: "--local-identifier",
    log_file_flag: Some("--log-file"),
    pid_file_flag: None,
    proxy_port_flag: Some("--local-proxy-port"),
    selenium_port_flag: None,
    ready: &["You can now access your local server(s) in our remote browser"],
    auth_failure: &["Authentication Failed", "Invalid key"],
    graceful: &["Disconnected", "Local Testing stopped"],
    transient: &[
        "Could not connect to server",
        "Connection reset",
        "Unable to connect to BrowserStack",
    ],
    downloads: Downloads {
        linux: "https://www.browserstack.com/browserstack-local/BrowserStackLocal-linux-x64.zip",
        macos: "https://www.browserstack.com/browserstack-local/BrowserStackLocal-darwin-x64.zip",
        windows: "https://www.browserstack.com/browserstack-local/BrowserStackLocal-win32.zip",
    },
};

static SAUCELABS: TunnelFlavor = TunnelFlavor {
    vendor: Vendor::SauceLabs,
    binary_name: "sc",
    user_flag: Some("--user"),
    key_flag: "--api-key",
    identifier_flag: "--tunnel-identifier",
    log_file_flag: Some("--logfile"),
    pid_file_flag: Some("--pidfile"),
    proxy_port_flag: Some("--scproxy-port"),
    selenium_port_flag: Some("--se-port"),
    ready: &["Sauce Connect is up, you may start your tests."],
    auth_failure: &["401 Unauthorized", "Unauthorized", "Login failed"],
    graceful: &["Goodbye."],
    transient: &[
        "Error bringing up tunnel VM",
        "Sauce Connect could not establish a connection",
        "Tunnel connection timed out",
        "failed to start tunnel VM",
    ],
    downloads: Downloads {
        linux: "https://saucelabs.com/downloads/sc-4.9.2-linux.tar.gz",
        macos: "https://saucelabs.com/downloads/sc-4.9.2-osx.zip",
        windows: "https://saucelabs.com/downloads/sc-4.9.2-win32.zip",
    },
};

static CROSSBROWSERTESTING: TunnelFlavor = TunnelFlavor {
    vendor: Vendor::CrossBrowserTesting,
    binary_name: "cbt_tunnels",
    user_flag: Some("--username"),
    key_flag: "--authkey",
    identifier_flag: "--tunnelname",
    log_file_flag: None,
    pid_file_flag: None,
    proxy_port_flag: Some("--proxyPort"),
    selenium_port_flag: None,
    ready: &["Connected!", "Tunnel is running"],
    auth_failure: &["Authentication error", "Invalid credentials"],
    graceful: &["Tunnel closed", "Bye!"],
    transient: &["socket hang up", "ECONNRESET", "Could not connect to tunnel server"],
    downloads: Downloads {
        linux: "https://github.com/crossbrowsertesting/cbt-tunnel-nodejs/releases/download/v0.9.11/cbt_tunnels-linux-x64.zip",
        macos: "https://github.com/crossbrowsertesting/cbt-tunnel-nodejs/releases/download/v0.9.11/cbt_tunnels-macos-x64.zip",
        windows: "https://github.com/crossbrowsertesting/cbt-tunnel-nodejs/releases/download/v0.9.11/cbt_tunnels-win-x64.zip",
    },
};

impl TunnelFlavor {
    pub fn for_vendor(vendor: Vendor) -> &'static TunnelFlavor {
        match vendor {
            Vendor::BrowserStack => &BROWSERSTACK,
            Vendor::SauceLabs => &SAUCELABS,
            Vendor::CrossBrowserTesting => &CROSSBROWSERTESTING,
        }
    }

    /// Executable file name on this platform
    pub fn executable_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.binary_name)
        } else {
            self.binary_name.to_string()
        }
    }

    /// Download URL for this platform
    pub fn download_url(&self) -> Option<&'static str> {
        match std::env::consts::OS {
            "linux" => Some(self.downloads.linux),
            "macos" => Some(self.downloads.macos),
            "windows" => Some(self.downloads.windows),
            _ => None,
        }
    }

    /// Flags that must all be supplied for two tunnels to coexist
    pub fn differentiator_flags(&self) -> Vec<&'static str> {
        [
            self.log_file_flag,
            self.pid_file_flag,
            self.proxy_port_flag,
            self.selenium_port_flag,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Whether `options` sets every differentiator this vendor supports
    pub fn has_differentiators(&self, options: &TunnelOptions) -> bool {
        (self.log_file_flag.is_none() || options.log_file.is_some())
            && (self.pid_file_flag.is_none() || options.pid_file.is_some())
            && (self.proxy_port_flag.is_none() || options.proxy_port.is_some())
            && (self.selenium_port_flag.is_none() || options.selenium_port.is_some())
    }

    /// Command line for a tunnel with an already-resolved identifier
    pub fn build_args(
        &self,
        credentials: &Credentials,
        options: &TunnelOptions,
        identifier: Option<&str>,
    ) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(flag) = self.user_flag {
            args.extend([flag.to_string(), credentials.username.clone()]);
        }
        args.extend([self.key_flag.to_string(), credentials.access_key.clone()]);

        if let Some(id) = identifier {
            args.extend([self.identifier_flag.to_string(), id.to_string()]);
        }

        let paths = [
            (self.log_file_flag, options.log_file.as_ref()),
            (self.pid_file_flag, options.pid_file.as_ref()),
        ];
        for (flag, value) in paths {
            if let (Some(flag), Some(value)) = (flag, value) {
                args.extend([flag.to_string(), value.display().to_string()]);
            }
        }

        let ports = [
            (self.proxy_port_flag, options.proxy_port),
            (self.selenium_port_flag, options.selenium_port),
        ];
        for (flag, value) in ports {
            if let (Some(flag), Some(value)) = (flag, value) {
                args.extend([flag.to_string(), value.to_string()]);
            }
        }

        args.extend(options.extra_args.iter().cloned());
        args
    }

    /// Command line for logs and error messages, access key blanked out
    pub fn redacted_command(&self, binary: &str, args: &[String]) -> String {
        let mut parts = vec![binary.to_string()];
        let mut hide_next = false;
        for arg in args {
            if hide_next {
                parts.push("***".to_string());
                hide_next = false;
            } else if arg == self.key_flag {
                parts.push(arg.clone());
                hide_next = true;
            } else if arg.starts_with(&format!("{}=", self.key_flag)) {
                parts.push(format!("{}=***", self.key_flag));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }

    /// Value of `flag` in an argv, accepting `--flag value` and `--flag=value`
    pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let prefix = format!("{}=", flag);
        args.iter().enumerate().find_map(|(i, arg)| {
            if arg == flag {
                args.get(i + 1).map(String::as_str)
            } else {
                arg.strip_prefix(&prefix)
            }
        })
    }

    /// Whether an argv (from the process table) carries every differentiator
    pub fn argv_has_differentiators(&self, args: &[String]) -> bool {
        self.differentiator_flags()
            .into_iter()
            .all(|flag| Self::flag_value(args, flag).is_some())
    }

    pub fn classify(&self, line: &str) -> LineKind {
        let hit = |markers: &[&str]| markers.iter().any(|m| line.contains(m));
        if hit(self.auth_failure) {
            LineKind::AuthFailure
        } else if hit(self.ready) {
            LineKind::Ready
        } else if hit(self.graceful) {
            LineKind::Graceful
        } else if hit(self.transient) {
            LineKind::Transient
        } else {
            LineKind::Other
        }
    }

    /// Whether captured output ends in a known transient bring-up failure
    pub fn is_transient_failure(&self, output: &str) -> bool {
        output
            .lines()
            .any(|line| self.classify(line) == LineKind::Transient)
    }

    pub fn is_graceful_exit(&self, output: &str) -> bool {
        output
            .lines()
            .any(|line| self.classify(line) == LineKind::Graceful)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn creds() -> Credentials {
        Credentials::new("alice", "secret-key")
    }

    #[test]
    fn test_sauce_args_include_all_differentiators() {
        let flavor = TunnelFlavor::for_vendor(Vendor::SauceLabs);
        let options = TunnelOptions {
            log_file: Some(PathBuf::from("/tmp/sc.log")),
            pid_file: Some(PathBuf::from("/tmp/sc.pid")),
            proxy_port: Some(8001),
            selenium_port: Some(4446),
            ..Default::default()
        };
        let args = flavor.build_args(&creds(), &options, Some("build-7"));

        assert_eq!(TunnelFlavor::flag_value(&args, "--user"), Some("alice"));
        assert_eq!(TunnelFlavor::flag_value(&args, "--tunnel-identifier"), Some("build-7"));
        assert_eq!(TunnelFlavor::flag_value(&args, "--se-port"), Some("4446"));
        assert!(flavor.has_differentiators(&options));
        assert!(flavor.argv_has_differentiators(&args));
    }

    #[test]
    fn test_browserstack_has_no_user_flag() {
        let flavor = TunnelFlavor::for_vendor(Vendor::BrowserStack);
        let args = flavor.build_args(&creds(), &TunnelOptions::default(), None);
        assert_eq!(args, vec!["--key".to_string(), "secret-key".to_string()]);
        assert_eq!(flavor.differentiator_flags(), vec!["--log-file", "--local-proxy-port"]);
    }

    #[test]
    fn test_redaction() {
        let flavor = TunnelFlavor::for_vendor(Vendor::SauceLabs);
        let args = flavor.build_args(&creds(), &TunnelOptions::default(), None);
        let line = flavor.redacted_command("/opt/sc", &args);
        assert_eq!(line, "/opt/sc --user alice --api-key ***");

        let inline = vec!["--api-key=secret-key".to_string()];
        assert_eq!(flavor.redacted_command("sc", &inline), "sc --api-key=***");
    }

    #[test]
    fn test_line_classification() {
        let flavor = TunnelFlavor::for_vendor(Vendor::SauceLabs);
        assert_eq!(
            flavor.classify("12 Jan 10:00:00 - Sauce Connect is up, you may start your tests."),
            LineKind::Ready
        );
        assert_eq!(flavor.classify("HTTP 401 Unauthorized"), LineKind::AuthFailure);
        assert_eq!(flavor.classify("Goodbye."), LineKind::Graceful);
        assert!(flavor.is_transient_failure("starting\nError bringing up tunnel VM\n"));
        assert!(!flavor.is_transient_failure("segfault"));
    }

    #[test]
    fn test_flag_value_forms() {
        let args: Vec<String> = ["--tunnelname=abc", "--proxyPort", "9000"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(TunnelFlavor::flag_value(&args, "--tunnelname"), Some("abc"));
        assert_eq!(TunnelFlavor::flag_value(&args, "--proxyPort"), Some("9000"));
        assert_eq!(TunnelFlavor::flag_value(&args, "--authkey"), None);
    }
}
