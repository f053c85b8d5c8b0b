//! DNS tester
//!
//! Confirms that a specific DNS server returns the records you expect:
//!
//! ```text
//! ns.example.com must run dns with lookup test.example.com with type A with result '1.2.3.4'
//! ```
//!
//! Lookups are supported for A, AAAA, MX, NS and TXT records. Answers are
//! rendered to strings, sorted, comma-joined and compared byte-for-byte with
//! the `result` argument. An empty `result` asserts that no records exist.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::core::{join_host_port, Options, Probe, Test};
use crate::error::{ProbeError, ProbeResult};

/// Registry name of this probe
pub const PROTOCOL: &str = "dns";

/// Port every DNS query is sent to
pub const DNS_PORT: u16 = 53;

// Large enough for EDNS-sized replies; plain UDP answers stop at 512 bytes
const MAX_RESPONSE_SIZE: usize = 4096;

/// Answers of one lookup, rendered to their canonical strings
pub type LookupResult = Vec<String>;

/// Record-type tokens accepted by the `type` argument
const RECORD_TYPES: &[(&str, RecordType)] = &[
    ("A", RecordType::A),
    ("AAAA", RecordType::AAAA),
    ("MX", RecordType::MX),
    ("NS", RecordType::NS),
    ("TXT", RecordType::TXT),
];

/// DNS resolution probe
///
/// Carries no state: the socket and the query message are built inside every
/// `run_test` call.
#[derive(Debug, Default)]
pub struct DnsProbe;

impl DnsProbe {
    pub fn new() -> Self {
        Self
    }
}

/// Registry constructor
pub fn factory() -> Box<dyn Probe> {
    Box::new(DnsProbe::new())
}

/// Map a record-type token onto its query type
pub fn parse_record_type(token: &str) -> ProbeResult<RecordType> {
    RECORD_TYPES
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, rtype)| *rtype)
        .ok_or_else(|| ProbeError::InvalidArgument(format!("unsupported record to lookup '{}'", token)))
}

/// Append the root label unless it is already there
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Render the supported answers of a response to canonical strings
///
/// Unsupported record types are skipped.
pub fn extract_answers(records: &[Record]) -> LookupResult {
    records
        .iter()
        .filter_map(|record| match record.data()? {
            RData::A(a) => Some(a.0.to_string()),
            // IPv4-mapped addresses render in dotted form
            RData::AAAA(aaaa) => Some(match aaaa.0.to_ipv4_mapped() {
                Some(v4) => v4.to_string(),
                None => aaaa.0.to_string(),
            }),
            RData::MX(mx) => Some(format!("{} {}", mx.preference(), mx.exchange())),
            RData::NS(ns) => Some(ns.0.to_string()),
            RData::TXT(txt) => Some(
                txt.txt_data()
                    .first()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .unwrap_or_default(),
            ),
            _ => None,
        })
        .collect()
}

/// Sort and comma-join answers into the form compared against `result`
pub fn join_sorted(mut answers: LookupResult) -> String {
    answers.sort();
    answers.join(",")
}

/// Compare the normalized answers with the expected string
pub fn compare_results(expected: &str, answers: LookupResult) -> ProbeResult<()> {
    let found = join_sorted(answers);
    if found != expected {
        return Err(ProbeError::Mismatch(format!(
            "expected DNS result to be '{}', but found '{}'",
            expected, found
        )));
    }
    Ok(())
}

/// Send one recursive query to `server` (a `host:port` string)
///
/// Response codes are handled in three ways: NOERROR yields the answers,
/// NXDOMAIN is an error, and every other code yields an empty answer list
/// with no error.
pub async fn query(server: &str, lookup: &str, record_type: RecordType, deadline: Duration) -> ProbeResult<LookupResult> {
    let qname = fqdn(lookup);
    let name = Name::from_ascii(&qname)?;

    let mut request = Message::new();
    request
        .set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));

    let response = timeout(deadline, exchange(server, &request, deadline))
        .await
        .map_err(|_| ProbeError::TimeoutError(deadline))??;

    match response.response_code() {
        ResponseCode::NoError => Ok(extract_answers(response.answers())),
        ResponseCode::NXDomain => Err(ProbeError::ProtocolError(format!("no such domain {}", qname))),
        other => {
            // Inconclusive codes count as an empty answer set, not a failure
            debug!("DNS server {} answered {} for {}, treating as empty", server, other, qname);
            Ok(Vec::new())
        }
    }
}

async fn exchange(server: &str, request: &Message, deadline: Duration) -> ProbeResult<Message> {
    let remote: SocketAddr = tokio::net::lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| ProbeError::NetworkError(format!("no address for {}", server)))?;

    let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    socket
        .send(&request.to_vec()?)
        .await
        .map_err(|e| ProbeError::from_io(e, deadline))?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    let len = socket
        .recv(&mut buf)
        .await
        .map_err(|e| ProbeError::from_io(e, deadline))?;

    let response = Message::from_vec(&buf[..len])?;
    if response.id() != request.id() {
        return Err(ProbeError::ProtocolError(format!(
            "response id {} does not match query id {}",
            response.id(),
            request.id()
        )));
    }
    Ok(response)
}

#[async_trait]
impl Probe for DnsProbe {
    fn arguments(&self) -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("type", "A|AAAA|MX|NS|TXT"),
            ("lookup", ".*"),
            ("result", ".*"),
        ])
    }

    fn should_resolve_hostname(&self) -> bool {
        true
    }

    fn example(&self) -> &'static str {
        r#"
DNS Tester
----------
 The DNS tester allows you to confirm that the specified DNS server
 returns the results you expect.  It is invoked with input like this:

    ns.example.com must run dns with lookup test.example.com with type A with result '1.2.3.4'

 This test ensures that the DNS lookup of an A record for 'test.example.com'
 returns the single value 1.2.3.4

 Lookups are supported for A, AAAA, MX, NS, and TXT records.  If you expect
 there to be zero returning records, perhaps because you're ensuring that a
 service is IPv4-only you can specify that you require an empty result:

    ns.example.com must run dns with lookup www.example.com with type AAAA with result ''
"#
    }

    async fn run_test(&self, test: &Test, target: &str, opts: Options) -> ProbeResult<()> {
        let lookup = test.argument("lookup");
        if lookup.is_empty() {
            return Err(ProbeError::InvalidArgument("no value to lookup specified".to_string()));
        }
        let rtype = test.argument("type");
        if rtype.is_empty() {
            return Err(ProbeError::InvalidArgument("no record-type to lookup".to_string()));
        }
        // `result` may legitimately be empty: it means "expect no records"
        let record_type = parse_record_type(rtype)?;

        let server = join_host_port(target, DNS_PORT);
        debug!("Querying {} for {} {}", server, rtype, lookup);

        let answers = query(&server, lookup, record_type, opts.timeout).await?;
        compare_results(test.argument("result"), answers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA, MX, NS, TXT};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    fn record(rdata: RData) -> Record {
        Record::from_rdata(name("test.example.com."), 300, rdata)
    }

    #[test]
    fn test_record_type_table() {
        assert_eq!(parse_record_type("A").unwrap(), RecordType::A);
        assert_eq!(parse_record_type("AAAA").unwrap(), RecordType::AAAA);
        assert_eq!(parse_record_type("MX").unwrap(), RecordType::MX);
        assert_eq!(parse_record_type("NS").unwrap(), RecordType::NS);
        assert_eq!(parse_record_type("TXT").unwrap(), RecordType::TXT);
        assert!(parse_record_type("SRV").unwrap_err().is_argument_error());
        assert!(parse_record_type("a").is_err());
    }

    #[test]
    fn test_fqdn() {
        assert_eq!(fqdn("example.com"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
    }

    #[test]
    fn test_extract_canonical_forms() {
        let records = vec![
            record(RData::A(A(Ipv4Addr::new(192, 0, 2, 1)))),
            record(RData::AAAA(AAAA(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)))),
            record(RData::MX(MX::new(10, name("mail.example.com.")))),
            record(RData::NS(NS(name("ns1.example.com.")))),
            record(RData::TXT(TXT::new(vec!["v=spf1 -all".to_string(), "second".to_string()]))),
        ];

        assert_eq!(
            extract_answers(&records),
            vec![
                "192.0.2.1".to_string(),
                "2001:db8::1".to_string(),
                "10 mail.example.com.".to_string(),
                "ns1.example.com.".to_string(),
                "v=spf1 -all".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_ipv4_mapped_aaaa() {
        let mapped = Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped();
        let records = vec![
            record(RData::AAAA(AAAA(mapped))),
            record(RData::AAAA(AAAA(Ipv6Addr::LOCALHOST))),
        ];
        assert_eq!(
            extract_answers(&records),
            vec!["192.0.2.1".to_string(), "::1".to_string()]
        );
    }

    #[test]
    fn test_extract_skips_unsupported_types() {
        let records = vec![
            record(RData::CNAME(hickory_proto::rr::rdata::CNAME(name("alias.example.com.")))),
            record(RData::A(A(Ipv4Addr::new(192, 0, 2, 9)))),
        ];
        assert_eq!(extract_answers(&records), vec!["192.0.2.9".to_string()]);
    }

    #[test]
    fn test_join_sorted_is_order_independent() {
        let a = join_sorted(vec!["b".to_string(), "a".to_string()]);
        let b = join_sorted(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a, "a,b");
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_result_matches_only_empty_answers() {
        assert!(compare_results("", Vec::new()).is_ok());

        let err = compare_results("", vec!["192.0.2.1".to_string()]).unwrap_err();
        assert!(matches!(err, ProbeError::Mismatch(_)));
        assert_eq!(
            err.to_string(),
            "expected DNS result to be '', but found '192.0.2.1'"
        );
    }

    #[tokio::test]
    async fn test_missing_arguments_rejected() {
        let probe = DnsProbe::new();
        let test = Test::new("192.0.2.1", PROTOCOL, "192.0.2.1 must run dns").with_argument("type", "A");
        let err = probe.run_test(&test, "192.0.2.1", Options::default()).await.unwrap_err();
        assert!(err.is_argument_error());

        let test = Test::new("192.0.2.1", PROTOCOL, "192.0.2.1 must run dns")
            .with_argument("lookup", "example.com");
        let err = probe.run_test(&test, "192.0.2.1", Options::default()).await.unwrap_err();
        assert!(err.is_argument_error());
    }
}
