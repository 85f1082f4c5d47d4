use crate::executor::Executor;
use crate::firewall_driver::{DriverConfig, DriverFuture, FirewallDriver, FirewallError};
use crate::rule_batch::{validate_address, ChainOp, RuleBatch, RuleOp, RuleOptions};
use std::net::IpAddr;

const TABLE: &str = "nat";
const MATCH: &str = "multiport";
const LOOPBACK: &str = "lo";

/// NAT redirect driver.
///
/// PREROUTING traffic for the guarded ports passes the allow chain, where granted clients are
/// accepted untouched, and then the deny chain, which redirects it to the knock server. Unless
/// local traffic is accepted, loopback OUTPUT is trapped the same way.
///
/// Concurrent grants for the same address may both insert an ACCEPT rule. The copies are
/// identical and harmless; each `delete_address` removes one of them.
pub struct NetfilterDriver {
    config: DriverConfig,
    allow_chain: String,
    deny_chain: String,
    executor: Executor,
}

impl NetfilterDriver {
    pub fn new(config: DriverConfig, executor: Executor) -> Self {
        log::info!(
            "Using netfilter driver, nat chains \"{}\" and \"{}\", ports {}",
            config.allow_chain(),
            config.deny_chain(),
            config.dports
        );
        if config.forward.is_empty() {
            log::warn!("No port forwards configured, denied traffic will not be redirected");
        }

        Self {
            allow_chain: config.allow_chain(),
            deny_chain: config.deny_chain(),
            config,
            executor,
        }
    }

    fn batch(&self) -> RuleBatch {
        let mut batch = RuleBatch::new(TABLE, &self.config.dports);
        batch.match_module(MATCH);
        batch
    }

    fn jump<'a>(&'a self, chain: &'a str, target: &'a str) -> RuleOptions<'a> {
        RuleOptions {
            chain: Some(chain),
            protocol: Some(self.config.protocol),
            jump: Some(target),
            ..Default::default()
        }
    }

    fn loopback_jump<'a>(&'a self, target: &'a str) -> RuleOptions<'a> {
        RuleOptions {
            out_interface: Some(LOOPBACK),
            ..self.jump("OUTPUT", target)
        }
    }

    /// Jumps from the built-in chains into ours, in precedence order
    fn hooks(&self, batch: &mut RuleBatch, op: RuleOp) -> Result<(), FirewallError> {
        let trap_local = || !self.config.accept_local;
        batch
            .rule(op, self.jump("PREROUTING", &self.allow_chain))?
            .rule(op, self.jump("PREROUTING", &self.deny_chain))?
            .rule_if(op, self.loopback_jump(&self.allow_chain), trap_local)?
            .rule_if(op, self.loopback_jump(&self.deny_chain), trap_local)?;
        Ok(())
    }

    pub(crate) fn render_install(&self) -> Result<String, FirewallError> {
        let mut batch = self.batch();
        batch
            .chain(ChainOp::New, &self.allow_chain, Default::default())
            .chain(ChainOp::New, &self.deny_chain, Default::default());
        self.hooks(&mut batch, RuleOp::Add)?;
        batch.rule_if(RuleOp::Add, self.jump(&self.deny_chain, "LOG"), || {
            self.config.log_rejected
        })?;

        for (guarded_port, local_port) in &self.config.forward {
            let guarded_port = guarded_port.to_string();
            batch.rule(
                RuleOp::Add,
                RuleOptions {
                    ports: Some(&guarded_port),
                    to_port: Some(*local_port),
                    ..self.jump(&self.deny_chain, "REDIRECT")
                },
            )?;
        }

        Ok(batch.flush())
    }

    pub(crate) fn render_uninstall(&self) -> Result<String, FirewallError> {
        let mut batch = self.batch();
        self.hooks(&mut batch, RuleOp::Delete)?;
        batch
            .chain(ChainOp::Flush, &self.allow_chain, Default::default())
            .chain(ChainOp::Flush, &self.deny_chain, Default::default())
            .chain(ChainOp::Delete, &self.allow_chain, Default::default())
            .chain(ChainOp::Delete, &self.deny_chain, Default::default());
        Ok(batch.flush())
    }

    pub(crate) fn render_purge(&self) -> String {
        self.batch()
            .chain(ChainOp::Flush, &self.allow_chain, Default::default())
            .flush()
    }

    pub(crate) fn render_list(&self) -> String {
        self.batch()
            .chain(ChainOp::ListRules, &self.allow_chain, Default::default())
            .flush()
    }

    pub(crate) fn render_client(
        &self,
        op: RuleOp,
        address: IpAddr,
    ) -> Result<String, FirewallError> {
        let address = address.to_string();
        let rulenum = (op == RuleOp::Insert).then_some(1);

        let mut batch = self.batch();
        batch.rule(
            op,
            self.config.client_rule(&self.allow_chain, &address, rulenum),
        )?;
        Ok(batch.flush())
    }
}

impl FirewallDriver for NetfilterDriver {
    fn install_rules(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.executor.execute(&self.render_install()?).await?;
            Ok(())
        })
    }

    fn uninstall_rules(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.executor.execute(&self.render_uninstall()?).await?;
            Ok(())
        })
    }

    fn purge_rules(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.executor.execute(&self.render_purge()).await?;
            Ok(())
        })
    }

    fn list_rules(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.executor.execute(&self.render_list()).await?) })
    }

    fn check_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            let address = validate_address(address).await?;
            let probe = self.render_client(RuleOp::Check, address)?;
            Ok(self.executor.execute_probe(&probe).await)
        })
    }

    fn add_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let address = validate_address(address).await?;
            self.executor
                .execute(&self.render_client(RuleOp::Insert, address)?)
                .await?;
            Ok(())
        })
    }

    fn delete_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let address = validate_address(address).await?;
            self.executor
                .execute(&self.render_client(RuleOp::Delete, address)?)
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::firewall_driver::test::config;
    use maplit::btreemap;
    use std::path::PathBuf;
    use tokio::time::Duration;

    fn ip(address: &str) -> IpAddr {
        address.parse().unwrap()
    }

    fn driver(config: DriverConfig) -> NetfilterDriver {
        let executor = Executor::new(
            PathBuf::from("/nonexistent/iptables"),
            Duration::from_secs(1),
            true,
            false,
        );
        NetfilterDriver::new(config, executor)
    }

    #[test]
    fn install() {
        assert_eq!(
            driver(config()).render_install().unwrap(),
            "iptables -t nat -N CATFLAP-ALLOW\n\
             iptables -t nat -N CATFLAP-DENY\n\
             iptables -t nat -A PREROUTING -p tcp -m multiport --dports 80,443 -j CATFLAP-ALLOW\n\
             iptables -t nat -A PREROUTING -p tcp -m multiport --dports 80,443 -j CATFLAP-DENY\n\
             iptables -t nat -A OUTPUT -o lo -p tcp -m multiport --dports 80,443 -j CATFLAP-ALLOW\n\
             iptables -t nat -A OUTPUT -o lo -p tcp -m multiport --dports 80,443 -j CATFLAP-DENY\n\
             iptables -t nat -A CATFLAP-DENY -p tcp -m multiport --dports 80,443 -j LOG\n\
             iptables -t nat -A CATFLAP-DENY -p tcp -m multiport --dports 80 -j REDIRECT --to-port 4777\n\
             iptables -t nat -A CATFLAP-DENY -p tcp -m multiport --dports 443 -j REDIRECT --to-port 4777\n"
        );
    }

    #[test]
    fn install_accepting_local_traffic() {
        let driver = driver(DriverConfig {
            accept_local: true,
            log_rejected: false,
            forward: btreemap! { 8080 => 4777 },
            dports: "8080".to_string(),
            ..config()
        });

        assert_eq!(
            driver.render_install().unwrap(),
            "iptables -t nat -N CATFLAP-ALLOW\n\
             iptables -t nat -N CATFLAP-DENY\n\
             iptables -t nat -A PREROUTING -p tcp -m multiport --dports 8080 -j CATFLAP-ALLOW\n\
             iptables -t nat -A PREROUTING -p tcp -m multiport --dports 8080 -j CATFLAP-DENY\n\
             iptables -t nat -A CATFLAP-DENY -p tcp -m multiport --dports 8080 -j REDIRECT --to-port 4777\n"
        );
    }

    #[test]
    fn uninstall() {
        assert_eq!(
            driver(config()).render_uninstall().unwrap(),
            "iptables -t nat -D PREROUTING -p tcp -m multiport --dports 80,443 -j CATFLAP-ALLOW\n\
             iptables -t nat -D PREROUTING -p tcp -m multiport --dports 80,443 -j CATFLAP-DENY\n\
             iptables -t nat -D OUTPUT -o lo -p tcp -m multiport --dports 80,443 -j CATFLAP-ALLOW\n\
             iptables -t nat -D OUTPUT -o lo -p tcp -m multiport --dports 80,443 -j CATFLAP-DENY\n\
             iptables -t nat -F CATFLAP-ALLOW\n\
             iptables -t nat -F CATFLAP-DENY\n\
             iptables -t nat -X CATFLAP-ALLOW\n\
             iptables -t nat -X CATFLAP-DENY\n"
        );
    }

    #[test]
    fn allow_chain_maintenance() {
        let driver = driver(config());
        assert_eq!(driver.render_purge(), "iptables -t nat -F CATFLAP-ALLOW\n");
        assert_eq!(driver.render_list(), "iptables -t nat -S CATFLAP-ALLOW\n");
        assert_eq!(
            driver.render_client(RuleOp::Insert, ip("127.0.0.1")).unwrap(),
            "iptables -t nat -I CATFLAP-ALLOW 1 -s 127.0.0.1 -p tcp -m multiport --dports 80,443 -j ACCEPT\n"
        );
        assert_eq!(
            driver.render_client(RuleOp::Delete, ip("192.0.2.7")).unwrap(),
            "iptables -t nat -D CATFLAP-ALLOW -s 192.0.2.7 -p tcp -m multiport --dports 80,443 -j ACCEPT\n"
        );
    }

    #[tokio::test]
    async fn bad_address_runs_nothing() {
        let driver = driver(config());
        assert!(driver.add_address("127.0??;as").await.is_err());
        assert!(driver.check_address("127.0.0.1 -j DROP").await.is_err());
    }
}
