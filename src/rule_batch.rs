mod statement;

pub use statement::{
    parse_address, validate_address, AddressError, ChainOp, ChainOptions, Context, RuleError, RuleOp,
    RuleOptions, RuleStatement, TOOL,
};

/// Ordered accumulator of iptables commands.
///
/// `table`, `match_module` and `ports` set the ambient context that later statements inherit.
/// `flush` drains the batch, so the same batch can be reused for the next command.
#[derive(Debug, Default)]
pub struct RuleBatch {
    table: Option<String>,
    match_module: Option<String>,
    ports: Option<String>,
    pending: Vec<Entry>,
}

#[derive(Debug)]
enum Entry {
    Statement(RuleStatement),
    Verbatim(String),
}

impl RuleBatch {
    pub fn new(table: &str, ports: &str) -> Self {
        Self {
            table: Some(table.to_string()),
            ports: Some(ports.to_string()),
            ..Default::default()
        }
    }

    #[allow(dead_code)]
    pub fn table(&mut self, table: &str) -> &mut Self {
        self.table = Some(table.to_string());
        self
    }

    #[allow(dead_code)]
    pub fn ports(&mut self, ports: &str) -> &mut Self {
        self.ports = Some(ports.to_string());
        self
    }

    pub fn match_module(&mut self, match_module: &str) -> &mut Self {
        self.match_module = Some(match_module.to_string());
        self
    }

    fn context(&self) -> Context {
        Context {
            table: self.table.as_deref(),
            match_module: self.match_module.as_deref(),
            ports: self.ports.as_deref(),
        }
    }

    pub fn chain(&mut self, op: ChainOp, chain: &str, options: ChainOptions) -> &mut Self {
        let statement = RuleStatement::chain(self.context(), op, chain, options);
        self.pending.push(Entry::Statement(statement));
        self
    }

    pub fn rule(&mut self, op: RuleOp, options: RuleOptions) -> Result<&mut Self, RuleError> {
        self.rule_if(op, options, || true)
    }

    /// Appends the rule only if `predicate` holds; otherwise the batch is left untouched.
    pub fn rule_if(
        &mut self,
        op: RuleOp,
        options: RuleOptions,
        predicate: impl FnOnce() -> bool,
    ) -> Result<&mut Self, RuleError> {
        if !predicate() {
            return Ok(self);
        }

        let statement = RuleStatement::rule(self.context(), op, options)?;
        self.pending.push(Entry::Statement(statement));
        Ok(self)
    }

    /// Replaces everything pending with `text`, for commands the builder cannot express
    #[allow(dead_code)]
    pub fn raw(&mut self, text: &str) -> &mut Self {
        self.pending.clear();
        self.pending.push(Entry::Verbatim(text.to_string()));
        self
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn flush(&mut self) -> String {
        let mut output = String::new();
        for entry in self.pending.drain(..) {
            match entry {
                Entry::Statement(statement) => output.push_str(&statement.to_string()),
                Entry::Verbatim(text) => output.push_str(text.trim_end_matches('\n')),
            }
            output.push('\n');
        }
        output
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn accept_from(src: &str) -> RuleOptions {
        RuleOptions {
            chain: Some("CATFLAP-ALLOW"),
            src: Some(src),
            jump: Some("ACCEPT"),
            ..Default::default()
        }
    }

    #[test]
    fn flush_drains() {
        let mut batch = RuleBatch::new("nat", "80,443");
        batch.chain(ChainOp::New, "CATFLAP-ALLOW", Default::default());

        assert_eq!(batch.flush(), "iptables -t nat -N CATFLAP-ALLOW\n");
        assert!(batch.is_empty());
        assert_eq!(batch.flush(), "");
    }

    #[test]
    fn append_order_survives_context_changes() {
        let mut batch = RuleBatch::new("filter", "80,443");
        batch
            .chain(ChainOp::New, "A", Default::default())
            .table("nat")
            .chain(ChainOp::New, "B", Default::default())
            .match_module("multiport")
            .ports("22")
            .rule(RuleOp::Add, accept_from("1.2.3.4"))
            .unwrap();

        assert_eq!(
            batch.flush(),
            "iptables -t filter -N A\n\
             iptables -t nat -N B\n\
             iptables -t nat -A CATFLAP-ALLOW -s 1.2.3.4 -p tcp -m multiport --dports 22 -j ACCEPT\n"
        );
    }

    #[test]
    fn false_predicate_is_a_no_op() {
        let mut with_skipped = RuleBatch::new("nat", "80,443");
        with_skipped
            .chain(ChainOp::New, "CATFLAP-ALLOW", Default::default())
            .rule_if(RuleOp::Add, accept_from("127.0.0.1"), || false)
            .unwrap()
            .chain(ChainOp::New, "CATFLAP-DENY", Default::default());

        let mut without = RuleBatch::new("nat", "80,443");
        without
            .chain(ChainOp::New, "CATFLAP-ALLOW", Default::default())
            .chain(ChainOp::New, "CATFLAP-DENY", Default::default());

        assert_eq!(with_skipped.flush(), without.flush());
    }

    #[test]
    fn false_predicate_skips_validation() {
        let mut batch = RuleBatch::new("nat", "80,443");
        assert!(batch
            .rule_if(RuleOp::Add, accept_from("&&&"), || false)
            .is_ok());
        assert!(batch.is_empty());
    }

    #[test]
    fn invalid_address_keeps_earlier_statements() {
        let mut batch = RuleBatch::new("nat", "80,443");
        batch.chain(ChainOp::Flush, "CATFLAP-ALLOW", Default::default());

        assert_matches!(
            batch.rule(RuleOp::Insert, accept_from("not an address")),
            Err(RuleError::InvalidAddress(_))
        );
        assert_eq!(batch.flush(), "iptables -t nat -F CATFLAP-ALLOW\n");
    }

    #[test]
    fn raw_replaces_pending() {
        let mut batch = RuleBatch::new("nat", "80,443");
        batch
            .chain(ChainOp::New, "CATFLAP-ALLOW", Default::default())
            .raw("iptables -t nat -S\n")
            .chain(ChainOp::Zero, "CATFLAP-ALLOW", Default::default());

        assert_eq!(
            batch.flush(),
            "iptables -t nat -S\niptables -t nat -Z CATFLAP-ALLOW\n"
        );
    }
}
