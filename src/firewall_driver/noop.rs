use crate::firewall_driver::{DriverFuture, FirewallDriver};
use crate::rule_batch::validate_address;

/// Driver without firewall integration.
///
/// Addresses are still validated, so callers see the same errors as with a real driver.
pub struct NoopDriver {
    _priv: (),
}

impl NoopDriver {
    pub fn new() -> Self {
        log::info!("Firewall driver is disabled");
        Self { _priv: () }
    }
}

impl FirewallDriver for NoopDriver {
    fn install_rules(&self) -> DriverFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn uninstall_rules(&self) -> DriverFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn purge_rules(&self) -> DriverFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn list_rules(&self) -> DriverFuture<'_, String> {
        Box::pin(async { Ok(String::new()) })
    }

    fn check_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            validate_address(address).await?;
            Ok(false)
        })
    }

    fn add_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            validate_address(address).await?;
            Ok(())
        })
    }

    fn delete_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            validate_address(address).await?;
            Ok(())
        })
    }
}
