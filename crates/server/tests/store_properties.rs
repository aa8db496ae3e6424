//! Store properties under arbitrary write sequences.

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;
use ricochet_common::{CorrelationId, InteractionRecord, Protocol};
use ricochet_server::Store;

fn id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,12}"
}

fn protocol_strategy() -> impl Strategy<Value = Protocol> {
    prop_oneof![
        Just(Protocol::Dns),
        Just(Protocol::Http),
        Just(Protocol::Smtp),
    ]
}

fn record(protocol: Protocol, id: &CorrelationId) -> InteractionRecord {
    InteractionRecord::new(protocol, id.clone(), "192.0.2.44:5000".parse().unwrap())
}

proptest! {
    /// Every record comes back under the id it was written to, never another
    #[test]
    fn records_never_cross_ids(
        writes in prop::collection::vec((id_strategy(), protocol_strategy()), 1..64)
    ) {
        let store = Store::new(Duration::from_secs(3600));
        let mut expected: HashMap<String, usize> = HashMap::new();

        for (id, protocol) in &writes {
            let id = CorrelationId::parse(id).unwrap();
            store.put(&id, record(*protocol, &id));
            *expected.entry(id.to_string()).or_default() += 1;
        }

        for (id, count) in &expected {
            let id = CorrelationId::parse(id).unwrap();
            let records = store.get(&id, None).unwrap();
            prop_assert_eq!(records.len(), *count);
            for record in &records {
                prop_assert_eq!(&record.correlation_id, &id);
            }
        }
        prop_assert_eq!(store.stats().records, 0);
    }

    /// N writes to one id yield N records, in write order
    #[test]
    fn n_puts_n_records(id in id_strategy(), n in 0usize..200) {
        let store = Store::new(Duration::from_secs(3600));
        let id = CorrelationId::parse(&id).unwrap();
        let mut written = Vec::with_capacity(n);

        for _ in 0..n {
            let record = record(Protocol::Http, &id);
            written.push(record.unique_id);
            store.put(&id, record);
        }

        let records = store.get(&id, None).unwrap();
        prop_assert_eq!(records.len(), n);
        let read: Vec<_> = records.into_iter().map(|r| r.unique_id).collect();
        prop_assert_eq!(read, written);
        prop_assert!(store.get(&id, None).unwrap().is_empty());
    }
}
