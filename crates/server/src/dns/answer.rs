//! Authoritative answers for the served zone.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, MX, NS, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use ricochet_common::CorrelationId;

use super::txt::TxtRecordCell;
use crate::zone::ZoneMatcher;

/// TTL of static zone records
const DEFAULT_TTL: u32 = 3600;

/// Challenge values must never be cached past the validation attempt
const CHALLENGE_TTL: u32 = 0;

const SOA_REFRESH: i32 = 86_400;
const SOA_RETRY: i32 = 7_200;
const SOA_EXPIRE: i32 = 3_600_000;
const SOA_MINIMUM: u32 = 172_800;

/// A query worth recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedQuery {
    pub id: CorrelationId,
    pub full_id: String,
    pub query_type: RecordType,
}

/// Response plus what to capture from the request
#[derive(Debug)]
pub struct Answer {
    pub response: Message,
    pub capture: Option<CapturedQuery>,
}

/// Builds responses for the zone; shared by every datagram task.
#[derive(Debug)]
pub struct DnsAnswerer {
    zone: ZoneMatcher,
    public_ip: Option<IpAddr>,
    apex: Name,
    nameservers: [Name; 2],
    mail: Name,
    hostmaster: Name,
    txt: Arc<TxtRecordCell>,
}

impl DnsAnswerer {
    pub fn new(
        zone: ZoneMatcher,
        public_ip: Option<IpAddr>,
        hostmaster: &str,
        txt: Arc<TxtRecordCell>,
    ) -> Result<Self, ProtoError> {
        let fqdn = |label: &str| Name::from_ascii(format!("{}{}.", label, zone.domain()));
        Ok(Self {
            apex: fqdn("")?,
            nameservers: [fqdn("ns1.")?, fqdn("ns2.")?],
            mail: fqdn("mail.")?,
            hostmaster: Name::from_ascii(format!("{}.", hostmaster.replacen('@', ".", 1)))?,
            zone,
            public_ip,
            txt,
        })
    }

    pub fn zone(&self) -> &ZoneMatcher {
        &self.zone
    }

    pub fn answer(&self, request: &Message) -> Answer {
        if request.message_type() != MessageType::Query || request.op_code() != OpCode::Query {
            return self.empty(request, ResponseCode::NotImp);
        }
        let Some(query) = request.queries().first() else {
            return self.empty(request, ResponseCode::FormErr);
        };

        let qname = query.name().to_ascii();
        if !self.zone.is_in_zone(&qname) {
            return self.empty(request, ResponseCode::Refused);
        }

        let owner = query.name().clone();
        let is_apex = owner.to_lowercase() == self.apex;
        let mut answers = Vec::new();
        let mut authority = Vec::new();

        match query.query_type() {
            RecordType::A | RecordType::ANY => {
                if let Some(IpAddr::V4(ip)) = self.public_ip {
                    answers.push(Record::from_rdata(owner, DEFAULT_TTL, RData::A(A(ip))));
                }
            }
            RecordType::AAAA => {
                if let Some(IpAddr::V6(ip)) = self.public_ip {
                    answers.push(Record::from_rdata(owner, DEFAULT_TTL, RData::AAAA(AAAA(ip))));
                }
            }
            RecordType::NS if is_apex => {
                for ns in &self.nameservers {
                    answers.push(Record::from_rdata(
                        owner.clone(),
                        DEFAULT_TTL,
                        RData::NS(NS(ns.clone())),
                    ));
                }
            }
            RecordType::SOA => answers.push(self.soa()),
            RecordType::MX => {
                answers.push(Record::from_rdata(
                    owner,
                    DEFAULT_TTL,
                    RData::MX(MX::new(1, self.mail.clone())),
                ));
            }
            RecordType::TXT if self.is_challenge_name(&qname) => {
                for value in self.txt.load().iter() {
                    answers.push(Record::from_rdata(
                        owner.clone(),
                        CHALLENGE_TTL,
                        RData::TXT(TXT::new(vec![value.clone()])),
                    ));
                }
            }
            _ => {}
        }

        if answers.is_empty() {
            authority.push(self.soa());
        }

        let mut response = self.response(request, ResponseCode::NoError);
        response.add_answers(answers);
        response.add_name_servers(authority);

        let capture = self.zone.dns_id(&qname).map(|id| CapturedQuery {
            id,
            full_id: self.zone.full_id(&qname),
            query_type: query.query_type(),
        });

        Answer { response, capture }
    }

    fn is_challenge_name(&self, qname: &str) -> bool {
        qname
            .trim_end_matches('.')
            .eq_ignore_ascii_case(&self.zone.acme_challenge_name())
    }

    fn soa(&self) -> Record {
        let serial = Utc::now()
            .format("%Y%m%d")
            .to_string()
            .parse()
            .unwrap_or(1);
        Record::from_rdata(
            self.apex.clone(),
            DEFAULT_TTL,
            RData::SOA(SOA::new(
                self.nameservers[0].clone(),
                self.hostmaster.clone(),
                serial,
                SOA_REFRESH,
                SOA_RETRY,
                SOA_EXPIRE,
                SOA_MINIMUM,
            )),
        )
    }

    fn response(&self, request: &Message, code: ResponseCode) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(false)
            .set_authoritative(code == ResponseCode::NoError)
            .set_response_code(code);
        response.add_queries(request.queries().iter().cloned());
        response
    }

    fn empty(&self, request: &Message, code: ResponseCode) -> Answer {
        Answer {
            response: self.response(request, code),
            capture: None,
        }
    }
}

/// dig-style transcript of a message, stored as the raw request/response
pub fn describe(message: &Message) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        ";; opcode: {:?}, status: {:?}, id: {}",
        message.op_code(),
        message.response_code(),
        message.id()
    );
    let _ = writeln!(out, ";; QUESTION SECTION:");
    for query in message.queries() {
        let _ = writeln!(
            out,
            ";{}\t{}\t{}",
            query.name(),
            query.query_class(),
            query.query_type()
        );
    }
    for (title, records) in [
        ("ANSWER", message.answers()),
        ("AUTHORITY", message.name_servers()),
    ] {
        if records.is_empty() {
            continue;
        }
        let _ = writeln!(out, ";; {} SECTION:", title);
        for record in records {
            let _ = writeln!(out, "{}", record);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    const PUBLIC: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

    fn answerer(root_tld: bool) -> (DnsAnswerer, Arc<TxtRecordCell>) {
        let cell = TxtRecordCell::new();
        let answerer = DnsAnswerer::new(
            ZoneMatcher::new("example.com", root_tld),
            Some(IpAddr::V4(PUBLIC)),
            "admin@example.com",
            Arc::clone(&cell),
        )
        .unwrap();
        (answerer, cell)
    }

    fn query(name: &str, rtype: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        message
    }

    #[test]
    fn test_a_record_and_capture() {
        let (answerer, _) = answerer(false);
        let answer = answerer.answer(&query("ABC123.example.com.", RecordType::A));

        assert_eq!(answer.response.id(), 4242);
        assert_eq!(answer.response.response_code(), ResponseCode::NoError);
        assert_eq!(
            answer.response.answers()[0].data(),
            Some(&RData::A(A(PUBLIC)))
        );

        let captured = answer.capture.unwrap();
        assert_eq!(captured.id.as_str(), "abc123");
        assert_eq!(captured.query_type, RecordType::A);
    }

    #[test]
    fn test_out_of_zone_refused() {
        let (answerer, _) = answerer(false);
        let answer = answerer.answer(&query("abc.example.org.", RecordType::A));

        assert_eq!(answer.response.response_code(), ResponseCode::Refused);
        assert!(answer.response.answers().is_empty());
        assert!(answer.capture.is_none());
    }

    #[test]
    fn test_apex_captured_only_in_root_tld_mode() {
        let (plain, _) = answerer(false);
        assert!(plain
            .answer(&query("example.com.", RecordType::A))
            .capture
            .is_none());

        let (rooted, _) = answerer(true);
        let captured = rooted
            .answer(&query("example.com.", RecordType::A))
            .capture
            .unwrap();
        assert_eq!(captured.id.as_str(), "example.com");
    }

    #[test]
    fn test_challenge_txt_served_from_cell() {
        let (answerer, cell) = answerer(false);
        let name = "_acme-challenge.example.com.";

        let before = answerer.answer(&query(name, RecordType::TXT));
        assert!(before.response.answers().is_empty());
        assert!(before.capture.is_none());

        super::super::TxtRecordHandle::new(Arc::clone(&cell))
            .set(vec!["token-a".to_string(), "token-b".to_string()]);

        let after = answerer.answer(&query(name, RecordType::TXT));
        let values: Vec<String> = after
            .response
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::TXT(txt)) => Some(txt.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec!["token-a", "token-b"]);
    }

    #[test]
    fn test_ns_soa_mx() {
        let (answerer, _) = answerer(false);

        let ns = answerer.answer(&query("example.com.", RecordType::NS));
        assert_eq!(ns.response.answers().len(), 2);

        let soa = answerer.answer(&query("example.com.", RecordType::SOA));
        match soa.response.answers()[0].data() {
            Some(RData::SOA(soa)) => {
                assert_eq!(soa.rname().to_ascii(), "admin.example.com.");
                assert_eq!(soa.mname().to_ascii(), "ns1.example.com.");
            }
            other => panic!("unexpected rdata {:?}", other),
        }

        let mx = answerer.answer(&query("abc.example.com.", RecordType::MX));
        assert!(matches!(
            mx.response.answers()[0].data(),
            Some(RData::MX(mx)) if mx.exchange().to_ascii() == "mail.example.com."
        ));
    }

    #[test]
    fn test_unsupported_type_is_empty_noerror() {
        let (answerer, _) = answerer(false);
        let answer = answerer.answer(&query("abc.example.com.", RecordType::SRV));

        assert_eq!(answer.response.response_code(), ResponseCode::NoError);
        assert!(answer.response.answers().is_empty());
        assert_eq!(answer.response.name_servers().len(), 1);
        assert!(answer.capture.is_some());
    }

    #[test]
    fn test_describe_lists_question() {
        let text = describe(&query("abc.example.com.", RecordType::A));
        assert!(text.contains("abc.example.com."));
        assert!(text.contains("QUESTION"));
    }
}
