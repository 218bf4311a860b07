use std::fmt;

/// The fairness key that caps how many requests one caller may have queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    /// Client-provided sticky token (`x-risu-tk`).
    Sticky(String),
    /// Every allow-listed shared/proxy IP collapses into one identity with a larger allowance.
    SharedIp,
    Ip(String),
}

impl Identity {
    pub fn resolve(
        user_token: Option<&str>,
        sticky_token: Option<&str>,
        ip: &str,
        shared_ips: &[String],
    ) -> Self {
        fn non_empty(s: Option<&str>) -> Option<&str> {
            s.map(str::trim).filter(|s| !s.is_empty())
        }
        if let Some(token) = non_empty(user_token) {
            return Identity::User(token.to_string());
        }
        if let Some(token) = non_empty(sticky_token) {
            return Identity::Sticky(token.to_string());
        }
        if shared_ips.iter().any(|s| s == ip) {
            return Identity::SharedIp;
        }
        Identity::Ip(ip.to_string())
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Identity::SharedIp)
    }

    pub fn allowance(&self, shared_allowance: usize) -> usize {
        if self.is_shared() { shared_allowance } else { 1 }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are credentials; only a short prefix goes to logs.
        let short = |s: &str| s.chars().take(6).collect::<String>();
        match self {
            Identity::User(t) => write!(f, "user:{}…", short(t)),
            Identity::Sticky(t) => write!(f, "sticky:{}…", short(t)),
            Identity::SharedIp => f.write_str("shared-ip"),
            Identity::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolution_order() {
        let shared = vec!["10.0.0.1".to_string()];
        assert_eq!(
            Identity::resolve(Some("tok"), Some("risu"), "10.0.0.1", &shared),
            Identity::User("tok".into())
        );
        assert_eq!(
            Identity::resolve(Some(" "), Some("risu"), "10.0.0.1", &shared),
            Identity::Sticky("risu".into())
        );
        assert_eq!(
            Identity::resolve(None, None, "10.0.0.1", &shared),
            Identity::SharedIp
        );
        assert_eq!(
            Identity::resolve(None, None, "10.0.0.2", &shared),
            Identity::Ip("10.0.0.2".into())
        );
    }

    #[test]
    fn tokens_are_trimmed_and_blank_ones_ignored() {
        assert_eq!(
            Identity::resolve(Some("  tok \t"), None, "1.2.3.4", &[]),
            Identity::User("tok".into())
        );
        assert_eq!(
            Identity::resolve(Some(""), Some(" risu "), "1.2.3.4", &[]),
            Identity::Sticky("risu".into())
        );
        assert_eq!(
            Identity::resolve(Some("\t"), Some("  "), "1.2.3.4", &[]),
            Identity::Ip("1.2.3.4".into())
        );
    }

    #[test]
    fn only_shared_ips_get_the_larger_allowance() {
        assert_eq!(Identity::SharedIp.allowance(5), 5);
        assert_eq!(Identity::Ip("1.2.3.4".into()).allowance(5), 1);
        assert_eq!(Identity::User("abcdefgh".into()).to_string(), "user:abcdef…");
    }
}
