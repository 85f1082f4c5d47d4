use crate::executor::Executor;
use crate::firewall_driver::{DriverConfig, DriverFuture, FirewallDriver, FirewallError};
use crate::rule_batch::{validate_address, ChainOp, RuleBatch, RuleOp, RuleOptions};
use std::net::IpAddr;

const TABLE: &str = "filter";
const MATCH: &str = "multiport";
const LOCALHOST: &str = "127.0.0.1";

/// Default-deny driver on the filter table.
///
/// INPUT traffic for the guarded ports jumps to the allow chain first, then to the deny chain,
/// which optionally logs and then rejects or drops.
///
/// Concurrent grants for the same address may both insert an ACCEPT rule. The copies are
/// identical and harmless; each `delete_address` removes one of them.
pub struct IptablesDriver {
    config: DriverConfig,
    allow_chain: String,
    deny_chain: String,
    executor: Executor,
}

impl IptablesDriver {
    pub fn new(config: DriverConfig, executor: Executor) -> Self {
        log::info!(
            "Using iptables driver, chains \"{}\" and \"{}\", ports {}",
            config.allow_chain(),
            config.deny_chain(),
            config.dports
        );

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

    fn append_accept_local(&self, batch: &mut RuleBatch) -> Result<(), FirewallError> {
        batch.rule_if(
            RuleOp::Add,
            self.config.client_rule(&self.allow_chain, LOCALHOST, None),
            || self.config.accept_local,
        )?;
        Ok(())
    }

    pub(crate) fn render_install(&self) -> Result<String, FirewallError> {
        let mut batch = self.batch();
        batch
            .chain(ChainOp::New, &self.allow_chain, Default::default())
            .chain(ChainOp::New, &self.deny_chain, Default::default());
        self.append_accept_local(&mut batch)?;
        batch
            .rule(RuleOp::Add, self.jump("INPUT", &self.allow_chain))?
            .rule(RuleOp::Add, self.jump("INPUT", &self.deny_chain))?
            .rule_if(RuleOp::Add, self.jump(&self.deny_chain, "LOG"), || {
                self.config.log_rejected
            })?
            .rule(
                RuleOp::Add,
                self.jump(&self.deny_chain, self.config.reject_policy.target()),
            )?;
        Ok(batch.flush())
    }

    pub(crate) fn render_uninstall(&self) -> Result<String, FirewallError> {
        let mut batch = self.batch();
        batch
            .rule(RuleOp::Delete, self.jump("INPUT", &self.allow_chain))?
            .rule(RuleOp::Delete, self.jump("INPUT", &self.deny_chain))?
            .chain(ChainOp::Flush, &self.allow_chain, Default::default())
            .chain(ChainOp::Flush, &self.deny_chain, Default::default())
            .chain(ChainOp::Delete, &self.allow_chain, Default::default())
            .chain(ChainOp::Delete, &self.deny_chain, Default::default());
        Ok(batch.flush())
    }

    /// Flushing also removes the local ACCEPT, so it is put back
    pub(crate) fn render_purge(&self) -> Result<String, FirewallError> {
        let mut batch = self.batch();
        batch.chain(ChainOp::Flush, &self.allow_chain, Default::default());
        self.append_accept_local(&mut batch)?;
        Ok(batch.flush())
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

impl FirewallDriver for IptablesDriver {
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
            self.executor.execute(&self.render_purge()?).await?;
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
    use crate::firewall_driver::RejectPolicy;
    use crate::rule_batch::RuleError;
    use assert_matches::assert_matches;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::time::Duration;

    fn ip(address: &str) -> IpAddr {
        address.parse().unwrap()
    }

    fn driver(config: DriverConfig) -> IptablesDriver {
        let executor = Executor::new(
            PathBuf::from("/nonexistent/iptables"),
            Duration::from_secs(1),
            true,
            false,
        );
        IptablesDriver::new(config, executor)
    }

    #[test]
    fn install() {
        assert_eq!(
            driver(config()).render_install().unwrap(),
            "iptables -t filter -N CATFLAP-ALLOW\n\
             iptables -t filter -N CATFLAP-DENY\n\
             iptables -t filter -A INPUT -p tcp -m multiport --dports 80,443 -j CATFLAP-ALLOW\n\
             iptables -t filter -A INPUT -p tcp -m multiport --dports 80,443 -j CATFLAP-DENY\n\
             iptables -t filter -A CATFLAP-DENY -p tcp -m multiport --dports 80,443 -j LOG\n\
             iptables -t filter -A CATFLAP-DENY -p tcp -m multiport --dports 80,443 -j REJECT\n"
        );
    }

    #[test]
    fn install_accept_local_and_drop() {
        let driver = driver(DriverConfig {
            log_rejected: false,
            accept_local: true,
            reject_policy: RejectPolicy::Drop,
            ..config()
        });

        assert_eq!(
            driver.render_install().unwrap(),
            "iptables -t filter -N CATFLAP-ALLOW\n\
             iptables -t filter -N CATFLAP-DENY\n\
             iptables -t filter -A CATFLAP-ALLOW -s 127.0.0.1 -p tcp -m multiport --dports 80,443 -j ACCEPT\n\
             iptables -t filter -A INPUT -p tcp -m multiport --dports 80,443 -j CATFLAP-ALLOW\n\
             iptables -t filter -A INPUT -p tcp -m multiport --dports 80,443 -j CATFLAP-DENY\n\
             iptables -t filter -A CATFLAP-DENY -p tcp -m multiport --dports 80,443 -j DROP\n"
        );
    }

    #[test]
    fn uninstall() {
        assert_eq!(
            driver(config()).render_uninstall().unwrap(),
            "iptables -t filter -D INPUT -p tcp -m multiport --dports 80,443 -j CATFLAP-ALLOW\n\
             iptables -t filter -D INPUT -p tcp -m multiport --dports 80,443 -j CATFLAP-DENY\n\
             iptables -t filter -F CATFLAP-ALLOW\n\
             iptables -t filter -F CATFLAP-DENY\n\
             iptables -t filter -X CATFLAP-ALLOW\n\
             iptables -t filter -X CATFLAP-DENY\n"
        );
    }

    #[test]
    fn purge_and_list() {
        let driver = driver(config());
        assert_eq!(
            driver.render_purge().unwrap(),
            "iptables -t filter -F CATFLAP-ALLOW\n"
        );
        assert_eq!(driver.render_list(), "iptables -t filter -S CATFLAP-ALLOW\n");

        let driver = super::IptablesDriver::new(
            DriverConfig {
                accept_local: true,
                ..config()
            },
            driver.executor.clone(),
        );
        assert_eq!(
            driver.render_purge().unwrap(),
            "iptables -t filter -F CATFLAP-ALLOW\n\
             iptables -t filter -A CATFLAP-ALLOW -s 127.0.0.1 -p tcp -m multiport --dports 80,443 -j ACCEPT\n"
        );
    }

    #[test]
    fn client_rules() {
        let driver = driver(config());
        assert_eq!(
            driver.render_client(RuleOp::Insert, ip("8.8.8.8")).unwrap(),
            "iptables -t filter -I CATFLAP-ALLOW 1 -s 8.8.8.8 -p tcp -m multiport --dports 80,443 -j ACCEPT\n"
        );
        assert_eq!(
            driver.render_client(RuleOp::Delete, ip("8.8.8.8")).unwrap(),
            "iptables -t filter -D CATFLAP-ALLOW -s 8.8.8.8 -p tcp -m multiport --dports 80,443 -j ACCEPT\n"
        );
        assert_eq!(
            driver.render_client(RuleOp::Check, ip("8.8.8.8")).unwrap(),
            "iptables -t filter -C CATFLAP-ALLOW -s 8.8.8.8 -p tcp -m multiport --dports 80,443 -j ACCEPT\n"
        );
    }

    #[tokio::test]
    async fn bad_address_is_rejected_before_execution() {
        let driver = driver(config());

        assert_matches!(
            driver.add_address("not an ip; not a hostname").await,
            Err(FirewallError::Rule(RuleError::InvalidAddress(_)))
        );
        assert_matches!(
            driver.check_address("&&&").await,
            Err(FirewallError::Rule(RuleError::InvalidAddress(_)))
        );
        assert_matches!(
            driver.revoke("$(reboot)").await,
            Err(FirewallError::Rule(RuleError::InvalidAddress(_)))
        );
    }

    /// Driver backed by a script that only knows an ACCEPT rule for 192.0.2.7
    fn stubbed_driver(dir: &TempDir) -> IptablesDriver {
        let calls = dir.path().join("calls");
        let program = dir.path().join("iptables");
        std::fs::write(
            &program,
            format!(
                "#!/bin/sh\necho \"$*\" >> {}\ncase \"$*\" in\n  *\"-C CATFLAP-ALLOW -s 192.0.2.7 \"*) exit 0 ;;\n  *) exit 1 ;;\nesac\n",
                calls.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        IptablesDriver::new(
            config(),
            Executor::new(program, Duration::from_secs(5), false, false),
        )
    }

    #[tokio::test]
    async fn repeated_checks_agree() {
        let dir = TempDir::new().unwrap();
        let driver = stubbed_driver(&dir);

        assert!(driver.check_address("192.0.2.7").await.unwrap());
        assert!(driver.check_address("192.0.2.7").await.unwrap());
        assert!(!driver.check_address("192.0.2.8").await.unwrap());
        assert!(!driver.check_address("192.0.2.8").await.unwrap());

        // Checking never adds or deletes rules
        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        assert_eq!(calls.lines().count(), 4);
        assert!(calls.lines().all(|call| call.starts_with("-t filter -C CATFLAP-ALLOW ")));
    }

    #[tokio::test]
    async fn noop_mode_never_reports_granted() {
        let driver = driver(config());
        assert!(!driver.check_address("10.0.0.1").await.unwrap());
        assert!(driver.grant("10.0.0.1").await.unwrap());
        assert!(!driver.revoke("10.0.0.1").await.unwrap());
    }
}
