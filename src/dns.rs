use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

lazy_static! {
    static ref ROOT_DOMAIN: Regex =
        Regex::new(r"(?i)([a-z0-9][a-z0-9\-]{1,63}\.[a-z.]{2,6})$").unwrap();
}

/// Nested `include:`/`redirect=` lookups allowed while evaluating SPF.
const SPF_LOOKUP_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("No SPF record found for {0}")]
    NoSpf(String),
    #[error("No DMARC record found for {0}")]
    NoDmarc(String),
    #[error("DNS lookup for {0} failed: {1}")]
    Lookup(String, String),
}

/// Result of a single DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NxDomain,
    TimedOut,
    Failed(String),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NxDomain => Lookup::NxDomain,
            Lookup::TimedOut => Lookup::TimedOut,
            Lookup::Failed(e) => Lookup::Failed(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Ptr,
    Txt,
    Mx,
    Cname,
}

/// Reverse lookups as the SMTP session needs them.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn ptr(&self, ip: IpAddr) -> Lookup<String>;
}

fn classify<T>(name: &str, error: ResolveError) -> Lookup<T> {
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Lookup::NxDomain,
        ResolveErrorKind::Timeout => Lookup::TimedOut,
        _ => {
            log::debug!("DNS lookup failed for {name}: {error}");
            Lookup::Failed(error.to_string())
        }
    }
}

fn trim_root(name: String) -> String {
    name.strip_suffix('.').map(str::to_string).unwrap_or(name)
}

/// The registrable part of a domain, e.g. `example.co.uk` for
/// `mail.example.co.uk`.
pub fn root_domain(domain: &str) -> Option<&str> {
    ROOT_DOMAIN
        .captures(domain)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Picks the SPF record out of a domain's TXT records, lower-cased.
pub fn spf_record(records: &[String]) -> Option<String> {
    records
        .iter()
        .map(|r| r.trim().to_lowercase())
        .find(|r| r == "v=spf1" || r.starts_with("v=spf1 "))
}

/// Parses a `v=DMARC1` record into its tags.
pub fn parse_dmarc(record: &str) -> Option<BTreeMap<String, String>> {
    let record = record.trim();
    if !record.get(..8).is_some_and(|v| v.eq_ignore_ascii_case("v=dmarc1")) {
        return None;
    }
    let tags = record
        .split(';')
        .filter_map(|tag| tag.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.eq_ignore_ascii_case("v"))
        .collect();
    Some(tags)
}

/// Whether `ip` lies in `network`, given as `addr` or `addr/prefix`.
fn in_network(ip: IpAddr, network: &str) -> bool {
    let (addr, prefix) = match network.split_once('/') {
        Some((addr, prefix)) => match prefix.parse::<u32>() {
            Ok(prefix) => (addr, Some(prefix)),
            Err(_) => return false,
        },
        None => (network, None),
    };
    match (ip, addr.parse::<IpAddr>()) {
        (IpAddr::V4(ip), Ok(IpAddr::V4(net))) => {
            let prefix = prefix.unwrap_or(32).min(32);
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), Ok(IpAddr::V6(net))) => {
            let prefix = prefix.unwrap_or(128).min(128);
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

/// Splits `a:host/24` style targets into host and optional prefix.
fn split_cidr<'a>(target: Option<&'a str>, fallback: &'a str) -> (&'a str, Option<&'a str>) {
    let target = target.unwrap_or(fallback);
    match target.split_once('/') {
        Some((host, prefix)) if host.is_empty() => (fallback, Some(prefix)),
        Some((host, prefix)) => (host, Some(prefix)),
        None => (target, None),
    }
}

fn with_prefix(ip: IpAddr, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) => format!("{ip}/{prefix}"),
        None => ip.to_string(),
    }
}

type SpfCheck<'a> = Pin<Box<dyn Future<Output = Result<Option<bool>, PolicyError>> + Send + 'a>>;

/// The resolver handed to workers at startup.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsResolver {
    pub fn from_system_conf(timeout: Duration) -> anyhow::Result<Self> {
        Ok(DnsResolver {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
            timeout,
        })
    }

    pub fn new(config: ResolverConfig, options: ResolverOpts, timeout: Duration) -> Self {
        DnsResolver {
            resolver: TokioAsyncResolver::tokio(config, options),
            timeout,
        }
    }

    async fn run<T, F>(&self, name: &str, lookup: F) -> Lookup<T>
    where
        F: Future<Output = Result<T, ResolveError>>,
    {
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(value)) => Lookup::Found(value),
            Ok(Err(e)) => classify(name, e),
            Err(_) => {
                log::debug!("DNS lookup timed out for {name} after {:?}", self.timeout);
                Lookup::TimedOut
            }
        }
    }

    pub async fn a(&self, name: &str) -> Lookup<Vec<IpAddr>> {
        self.run(name, self.resolver.lookup_ip(name))
            .await
            .map(|ips| ips.iter().collect())
    }

    pub async fn reverse(&self, ip: IpAddr) -> Lookup<String> {
        let name = ip.to_string();
        match self.run(&name, self.resolver.reverse_lookup(ip)).await {
            Lookup::Found(names) => match names.iter().next() {
                Some(ptr) => Lookup::Found(trim_root(ptr.to_string())),
                None => Lookup::NxDomain,
            },
            Lookup::NxDomain => Lookup::NxDomain,
            Lookup::TimedOut => Lookup::TimedOut,
            Lookup::Failed(e) => Lookup::Failed(e),
        }
    }

    pub async fn txt(&self, name: &str) -> Lookup<Vec<String>> {
        self.run(name, self.resolver.txt_lookup(name))
            .await
            .map(|records| {
                records
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|data| String::from_utf8_lossy(data).into_owned())
                            .collect::<String>()
                    })
                    .collect()
            })
    }

    /// MX hosts ordered by preference.
    pub async fn mx(&self, name: &str) -> Lookup<Vec<(u16, String)>> {
        self.run(name, self.resolver.mx_lookup(name))
            .await
            .map(|records| {
                let mut hosts: Vec<(u16, String)> = records
                    .iter()
                    .map(|mx| (mx.preference(), trim_root(mx.exchange().to_string())))
                    .collect();
                hosts.sort();
                hosts
            })
    }

    pub async fn cname(&self, name: &str) -> Lookup<Vec<String>> {
        self.run(name, self.resolver.lookup(name, RecordType::CNAME))
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .filter_map(|rdata| match rdata {
                        RData::CNAME(target) => Some(trim_root(target.to_string())),
                        _ => None,
                    })
                    .collect()
            })
    }

    /// Any query type, with answers rendered as strings.
    pub async fn query(&self, kind: QueryType, name: &str) -> Lookup<Vec<String>> {
        match kind {
            QueryType::A => self
                .a(name)
                .await
                .map(|ips| ips.iter().map(IpAddr::to_string).collect()),
            QueryType::Ptr => match name.parse::<IpAddr>() {
                Ok(ip) => self.reverse(ip).await.map(|host| vec![host]),
                Err(_) => Lookup::Failed(format!("not an IP address: {name}")),
            },
            QueryType::Txt => self.txt(name).await,
            QueryType::Mx => self
                .mx(name)
                .await
                .map(|hosts| hosts.into_iter().map(|(p, h)| format!("{p} {h}")).collect()),
            QueryType::Cname => self.cname(name).await,
        }
    }

    /// The SPF record published by `domain`.
    pub async fn spf(&self, domain: &str) -> Result<String, PolicyError> {
        match self.txt(domain).await {
            Lookup::Found(records) => {
                spf_record(&records).ok_or_else(|| PolicyError::NoSpf(domain.to_string()))
            }
            Lookup::NxDomain => Err(PolicyError::NoSpf(domain.to_string())),
            Lookup::TimedOut => Err(PolicyError::Lookup(domain.to_string(), "timed out".to_string())),
            Lookup::Failed(e) => Err(PolicyError::Lookup(domain.to_string(), e)),
        }
    }

    /// Whether the SPF record of `domain` authorises `ip`. Supports the
    /// `ip4`, `ip6`, `a`, `mx`, `include` and `all` mechanisms and the
    /// `redirect` modifier; a neutral or unmatched record counts as not
    /// authorised.
    pub async fn ip_in_spf(&self, ip: IpAddr, domain: &str) -> Result<bool, PolicyError> {
        Ok(self.check_spf(ip, domain.to_string(), 0).await?.unwrap_or(false))
    }

    fn check_spf(&self, ip: IpAddr, domain: String, depth: usize) -> SpfCheck<'_> {
        Box::pin(async move {
            if depth > SPF_LOOKUP_LIMIT {
                log::debug!("SPF lookup limit reached at {domain}");
                return Ok(None);
            }
            let record = self.spf(&domain).await?;
            let mut redirect = None;

            for term in record.split_whitespace().skip(1) {
                if let Some(target) = term.strip_prefix("redirect=") {
                    redirect = Some(target.to_string());
                    continue;
                }
                let (pass, mechanism) = match term.chars().next() {
                    Some('+') => (Some(true), &term[1..]),
                    Some('-') | Some('~') => (Some(false), &term[1..]),
                    Some('?') => (None, &term[1..]),
                    _ => (Some(true), term),
                };
                let (name, target) = match mechanism.split_once([':', '/']) {
                    Some((name, _)) => {
                        let rest = &mechanism[name.len()..];
                        (name, rest.strip_prefix(':').or(Some(rest).filter(|r| !r.is_empty())))
                    }
                    None => (mechanism, None),
                };

                let matched = match name {
                    "all" => true,
                    "ip4" | "ip6" => target.is_some_and(|network| in_network(ip, network)),
                    "a" => {
                        let (host, prefix) = split_cidr(target, &domain);
                        match self.a(host).await {
                            Lookup::Found(addrs) => addrs
                                .into_iter()
                                .any(|addr| in_network(ip, &with_prefix(addr, prefix))),
                            _ => false,
                        }
                    }
                    "mx" => {
                        let (host, prefix) = split_cidr(target, &domain);
                        let mut matched = false;
                        if let Lookup::Found(hosts) = self.mx(host).await {
                            for (_, exchange) in hosts {
                                if let Lookup::Found(addrs) = self.a(&exchange).await {
                                    if addrs
                                        .into_iter()
                                        .any(|addr| in_network(ip, &with_prefix(addr, prefix)))
                                    {
                                        matched = true;
                                        break;
                                    }
                                }
                            }
                        }
                        matched
                    }
                    "include" => match target {
                        Some(included) => matches!(
                            self.check_spf(ip, included.to_string(), depth + 1).await,
                            Ok(Some(true))
                        ),
                        None => false,
                    },
                    _ => false,
                };
                if matched {
                    return Ok(pass);
                }
            }

            match redirect {
                Some(target) => self.check_spf(ip, target, depth + 1).await,
                None => Ok(None),
            }
        })
    }

    /// DMARC tags for `domain`, falling back to the root domain when a
    /// subdomain publishes none.
    pub async fn dmarc(&self, domain: &str) -> Result<BTreeMap<String, String>, PolicyError> {
        let name = format!("_dmarc.{domain}");
        match self.txt(&name).await {
            Lookup::Found(records) => {
                if let Some(tags) = records.iter().find_map(|r| parse_dmarc(r)) {
                    return Ok(tags);
                }
            }
            Lookup::NxDomain => {}
            Lookup::TimedOut => return Err(PolicyError::Lookup(name, "timed out".to_string())),
            Lookup::Failed(e) => return Err(PolicyError::Lookup(name, e)),
        }

        match root_domain(domain) {
            Some(root) if !root.eq_ignore_ascii_case(domain) => Box::pin(self.dmarc(root)).await,
            _ => Err(PolicyError::NoDmarc(domain.to_string())),
        }
    }

    /// Runs several queries concurrently; answers come back in query order.
    pub async fn batch(&self, queries: Vec<(QueryType, String)>) -> Vec<Lookup<Vec<String>>> {
        let mut tasks = tokio::task::JoinSet::new();
        for (index, (kind, name)) in queries.into_iter().enumerate() {
            let resolver = self.clone();
            tasks.spawn(async move { (index, resolver.query(kind, &name).await) });
        }

        let mut answers = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(answer) => answers.push(answer),
                Err(e) => log::warn!("DNS batch task failed: {e}"),
            }
        }
        answers.sort_by_key(|(index, _)| *index);
        answers.into_iter().map(|(_, answer)| answer).collect()
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn ptr(&self, ip: IpAddr) -> Lookup<String> {
        self.reverse(ip).await
    }
}
