//! Local capability checks run before any vendor call

use crossrun_common::{Browser, Capabilities, Error, Result, TunnelOptions, Vendor};

/// Rejects browser/capability combinations a vendor cannot run
pub trait CapabilityValidator: Send + Sync {
    fn validate(&self, vendor: Vendor, browser: &Browser, capabilities: &Capabilities) -> Result<()>;
}

/// Required fields and vendor browser names
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicValidator;

pub fn browsers(vendor: Vendor) -> &'static [&'static str] {
    match vendor {
        Vendor::BrowserStack => &[
            "chrome", "firefox", "safari", "edge", "ie", "opera", "android", "iphone", "ipad",
        ],
        Vendor::SauceLabs => &[
            "chrome",
            "firefox",
            "safari",
            "microsoftedge",
            "internet explorer",
            "android",
            "iphone",
            "ipad",
        ],
        Vendor::CrossBrowserTesting => &[
            "chrome",
            "firefox",
            "safari",
            "edge",
            "internet explorer",
            "opera",
        ],
    }
}

fn invalid(field: &str, value: &str, options: &[&str]) -> Error {
    Error::Input(format!(
        "{} '{}' is not valid, valid options are: {}",
        field,
        value,
        options.join(", ")
    ))
}

impl CapabilityValidator for BasicValidator {
    fn validate(&self, vendor: Vendor, browser: &Browser, capabilities: &Capabilities) -> Result<()> {
        let names = browsers(vendor);
        if !names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(browser.browser.trim()))
        {
            return Err(invalid("browser", &browser.browser, names));
        }

        if browser.os.trim().is_empty() {
            return Err(Error::Input(format!("os is required for {}", browser.browser)));
        }

        let tunnel = &capabilities.tunnel;
        if let (Some(proxy), Some(selenium)) = (tunnel.proxy_port, tunnel.selenium_port) {
            if proxy == selenium {
                return Err(Error::Input(format!(
                    "selenium_port '{}' is not valid, it must differ from proxy_port",
                    selenium
                )));
            }
        }

        if !capabilities.local && *tunnel != TunnelOptions::default() {
            return Err(Error::Input(
                "tunnel options were given but local is not enabled".to_string(),
            ));
        }
        Ok(())
    }
}
