//! End-to-end injector tests
//!
//! Each test drives the injector frame by frame, playing both the
//! client and the server, and asserts on exactly what each side is
//! allowed to observe.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use electric_common::features::FeatureFlags;

use super::queries::QueryGenerator;
use super::{Actions, ElectrifiedRegistry, Event, Injector};
use crate::permissions::{Rules, RulesStore};
use crate::wire::{
    BackendMessage as B, DescribeTarget, FieldDescription, FrontendMessage as F,
    TransactionStatus as TS,
};

/// Deterministic stand-in for the production query generator
struct MockGenerator;

impl QueryGenerator for MockGenerator {
    fn capture_version(&self, version: &str) -> String {
        format!("INSERT INTO test_versions (version) VALUES ('{version}')")
    }

    fn save_rules(&self, rules: &Rules) -> String {
        format!(
            "INSERT INTO test_rules (rules) VALUES ('{}')",
            rules.grants.len() + rules.assigns.len()
        )
    }

    fn generate_version(&self) -> String {
        "100".into()
    }
}

struct Harness {
    injector: Injector,
    rules: Arc<RulesStore>,
    registry: ElectrifiedRegistry,
    /// Every Query the injector ever sent upstream, in order
    sent: Vec<String>,
}

#[derive(Debug, Default)]
struct Out {
    client: Vec<B>,
    server: Vec<F>,
    events: Vec<Event>,
}

impl Harness {
    fn new(electrified: &[&str]) -> Self {
        Self::with_flags(electrified, FeatureFlags::all())
    }

    fn with_flags(electrified: &[&str], flags: FeatureFlags) -> Self {
        let registry: ElectrifiedRegistry = Arc::new(RwLock::new(
            electrified.iter().map(|t| t.to_string()).collect::<HashSet<_>>(),
        ));
        let rules = RulesStore::new(Rules::default());
        let injector = Injector::new(
            Arc::new(MockGenerator),
            flags,
            registry.clone(),
            rules.clone(),
        );
        Self {
            injector,
            rules,
            registry,
            sent: Vec::new(),
        }
    }

    fn absorb(&mut self, actions: Actions) -> Out {
        for frame in &actions.to_server {
            if let F::Query { sql } = frame {
                self.sent.push(sql.clone());
            }
        }
        Out {
            client: actions.to_client,
            server: actions.to_server,
            events: actions.events,
        }
    }

    fn client(&mut self, msg: F) -> Out {
        let actions = self.injector.handle_client(msg).unwrap();
        self.absorb(actions)
    }

    fn server(&mut self, msg: B) -> Out {
        let actions = self.injector.handle_server(msg).unwrap();
        self.absorb(actions)
    }

    fn server_all(&mut self, msgs: Vec<B>) -> Out {
        let mut out = Out::default();
        for msg in msgs {
            let step = self.server(msg);
            out.client.extend(step.client);
            out.server.extend(step.server);
            out.events.extend(step.events);
        }
        out
    }

    /// Open an explicit transaction over the simple protocol
    fn begin_simple(&mut self) {
        let out = self.client(query("BEGIN"));
        assert_eq!(sqls(&out.server), vec!["BEGIN"]);
        let out = self.server_all(vec![cc("BEGIN"), rfq(TS::InTransaction)]);
        assert_eq!(out.client, vec![cc("BEGIN"), rfq(TS::InTransaction)]);
    }
}

fn query(sql: &str) -> F {
    F::Query { sql: sql.into() }
}

fn cc(tag: &str) -> B {
    B::CommandComplete { tag: tag.into() }
}

fn rfq(status: TS) -> B {
    B::ReadyForQuery { status }
}

fn sqls(frames: &[F]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            F::Query { sql } => Some(sql.clone()),
            _ => None,
        })
        .collect()
}

fn data_row(fields: &[Option<&str>]) -> B {
    B::DataRow {
        values: fields
            .iter()
            .map(|f| f.map(|s| Bytes::copy_from_slice(s.as_bytes())))
            .collect(),
    }
}

/// Introspection reply rows for a simple table
fn introspect_reply(pk: bool, electrified: bool) -> Vec<B> {
    let mut msgs = vec![B::RowDescription {
        fields: ["kind", "f1", "f2", "f3", "f4", "f5"]
            .iter()
            .map(|n| FieldDescription::text(*n))
            .collect(),
    }];
    msgs.push(data_row(&[
        Some("column"),
        Some("id"),
        Some("uuid"),
        Some("f"),
        None,
        None,
    ]));
    msgs.push(data_row(&[
        Some("column"),
        Some("name"),
        Some("text"),
        Some("t"),
        None,
        None,
    ]));
    msgs.push(data_row(&[
        Some("column"),
        Some("user_id"),
        Some("uuid"),
        Some("t"),
        None,
        None,
    ]));
    msgs.push(data_row(&[
        Some("column"),
        Some("role_name"),
        Some("text"),
        Some("t"),
        None,
        None,
    ]));
    if pk {
        msgs.push(data_row(&[Some("pk"), Some("id"), None, None, None, None]));
    }
    msgs.push(data_row(&[
        Some("electrified"),
        Some(if electrified { "t" } else { "f" }),
        None,
        None,
        None,
        None,
    ]));
    msgs.push(cc("SELECT 6"));
    msgs.push(rfq(TS::InTransaction));
    msgs
}

fn is_introspection(sql: &str) -> bool {
    sql.contains("pg_attribute")
}

// ---------------------------------------------------------------------
// Seed scenarios
// ---------------------------------------------------------------------

/// Extended-protocol transaction touching nothing electrified: every
/// frame passes through, nothing synthetic reaches the server.
#[test]
fn test_passthrough_adhoc_migration() {
    let mut h = Harness::new(&[]);

    // BEGIN through the extended protocol
    let out = h.client(F::Parse {
        statement: String::new(),
        sql: "BEGIN".into(),
        param_types: vec![],
    });
    assert!(matches!(out.server[0], F::Parse { .. }));
    let out = h.client(F::Bind {
        portal: String::new(),
        statement: String::new(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    assert!(matches!(out.server[0], F::Bind { .. }));
    let out = h.client(F::Execute {
        portal: String::new(),
        max_rows: 0,
    });
    assert!(matches!(out.server[0], F::Execute { .. }));
    let out = h.client(F::Sync);
    assert!(matches!(out.server[0], F::Sync));

    let out = h.server_all(vec![
        B::ParseComplete,
        B::BindComplete,
        cc("BEGIN"),
        rfq(TS::InTransaction),
    ]);
    assert_eq!(
        out.client,
        vec![
            B::ParseComplete,
            B::BindComplete,
            cc("BEGIN"),
            rfq(TS::InTransaction)
        ]
    );

    // Non-electrified CREATE TABLE
    let out = h.client(F::Parse {
        statement: String::new(),
        sql: "CREATE TABLE foo (id int)".into(),
        param_types: vec![],
    });
    assert!(matches!(out.server[0], F::Parse { .. }));
    h.client(F::Bind {
        portal: String::new(),
        statement: String::new(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    h.client(F::Execute {
        portal: String::new(),
        max_rows: 0,
    });
    h.client(F::Sync);
    let out = h.server_all(vec![
        B::ParseComplete,
        B::BindComplete,
        cc("CREATE TABLE"),
        rfq(TS::InTransaction),
    ]);
    assert_eq!(
        out.client,
        vec![
            B::ParseComplete,
            B::BindComplete,
            cc("CREATE TABLE"),
            rfq(TS::InTransaction)
        ]
    );

    // COMMIT of a clean transaction is forwarded, not intercepted
    let out = h.client(F::Parse {
        statement: String::new(),
        sql: "COMMIT".into(),
        param_types: vec![],
    });
    assert!(matches!(out.server[0], F::Parse { .. }));
    h.client(F::Bind {
        portal: String::new(),
        statement: String::new(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    h.client(F::Execute {
        portal: String::new(),
        max_rows: 0,
    });
    h.client(F::Sync);
    let out = h.server_all(vec![
        B::ParseComplete,
        B::BindComplete,
        cc("COMMIT"),
        rfq(TS::Idle),
    ]);
    assert_eq!(
        out.client,
        vec![B::ParseComplete, B::BindComplete, cc("COMMIT"), rfq(TS::Idle)]
    );

    // No version capture ever happened
    assert!(h.sent.iter().all(|sql| !sql.contains("test_versions")));
}

/// Simple-protocol migration on an electrified table: statements flow
/// through; COMMIT gains a version-capture insert.
#[test]
fn test_electrified_migration_simple() {
    let mut h = Harness::new(&["public.users"]);
    h.begin_simple();

    let alter = "ALTER TABLE users ADD COLUMN email text";
    let out = h.client(query(alter));
    assert_eq!(sqls(&out.server), vec![alter]);
    let out = h.server_all(vec![cc("ALTER TABLE"), rfq(TS::InTransaction)]);
    assert_eq!(out.client, vec![cc("ALTER TABLE"), rfq(TS::InTransaction)]);

    // COMMIT is intercepted: version capture first, then the real COMMIT
    let out = h.client(query("COMMIT"));
    assert_eq!(
        sqls(&out.server),
        vec!["INSERT INTO test_versions (version) VALUES ('100')"]
    );
    let out = h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]);
    assert!(out.client.is_empty(), "version capture must stay hidden");
    assert_eq!(sqls(&out.server), vec!["COMMIT"]);

    let out = h.server_all(vec![cc("COMMIT"), rfq(TS::Idle)]);
    assert_eq!(out.client, vec![cc("COMMIT"), rfq(TS::Idle)]);
}

/// ELECTRIC GRANT: never reaches the server, one introspection, rules
/// folded and saved once at commit, after the version capture.
#[test]
fn test_electric_grant_simple() {
    let mut h = Harness::new(&["public.projects"]);
    h.begin_simple();

    let out = h.client(query("ELECTRIC GRANT ALL ON projects TO 'member'"));
    let upstream = sqls(&out.server);
    assert_eq!(upstream.len(), 1);
    assert!(is_introspection(&upstream[0]));
    assert!(upstream[0].contains("to_regclass('public.projects')"));

    let out = h.server_all(introspect_reply(true, true));
    assert_eq!(
        out.client,
        vec![cc("ELECTRIC GRANT"), rfq(TS::InTransaction)],
        "exactly one completion with the canonical tag"
    );

    let out = h.client(query("COMMIT"));
    assert_eq!(out.events, vec![Event::LockRules]);
    assert_eq!(
        sqls(&out.server),
        vec!["INSERT INTO test_versions (version) VALUES ('100')"]
    );

    let out = h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]);
    assert_eq!(sqls(&out.server), vec!["INSERT INTO test_rules (rules) VALUES ('4')"]);
    assert!(out.client.is_empty());

    let out = h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]);
    assert_eq!(sqls(&out.server), vec!["COMMIT"]);
    assert!(out.client.is_empty());

    let out = h.server_all(vec![cc("COMMIT"), rfq(TS::Idle)]);
    assert_eq!(out.client, vec![cc("COMMIT"), rfq(TS::Idle)]);
    assert!(out.events.contains(&Event::ReleaseRules));

    // The fold was published to the shared store
    assert_eq!(h.rules.snapshot().grants.len(), 4);
    // The ELECTRIC statement itself never reached the server
    assert!(h.sent.iter().all(|sql| !sql.contains("ELECTRIC")));
    // Ordering: version capture before rules save before COMMIT
    let versions = h.sent.iter().position(|s| s.contains("test_versions")).unwrap();
    let rules = h.sent.iter().position(|s| s.contains("test_rules")).unwrap();
    let commit = h.sent.iter().rposition(|s| s == "COMMIT").unwrap();
    assert!(versions < rules && rules < commit);
}

/// ELECTRIC ASSIGN + ELECTRIC GRANT in one transaction: two synthetic
/// completions, one rules save carrying both folds.
#[test]
fn test_assign_and_grant_one_transaction() {
    let mut h = Harness::new(&["public.projects", "public.memberships"]);
    h.begin_simple();

    h.client(query(
        "ELECTRIC ASSIGN (projects, memberships.role_name) TO memberships.user_id",
    ));
    let out = h.server_all(introspect_reply(true, true));
    assert_eq!(out.client, vec![cc("ELECTRIC ASSIGN"), rfq(TS::InTransaction)]);

    h.client(query("ELECTRIC GRANT READ ON projects TO 'member'"));
    let out = h.server_all(introspect_reply(true, true));
    assert_eq!(out.client, vec![cc("ELECTRIC GRANT"), rfq(TS::InTransaction)]);

    h.client(query("COMMIT"));
    h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]); // version
    h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]); // rules
    let out = h.server_all(vec![cc("COMMIT"), rfq(TS::Idle)]);
    assert_eq!(out.client, vec![cc("COMMIT"), rfq(TS::Idle)]);

    let saves: Vec<_> = h.sent.iter().filter(|s| s.contains("test_rules")).collect();
    assert_eq!(saves.len(), 1, "exactly one permissions save per commit");
    // 1 assignment + 1 grant action
    assert_eq!(saves[0], &"INSERT INTO test_rules (rules) VALUES ('2')");

    let published = h.rules.snapshot();
    assert_eq!(published.assigns.len(), 1);
    assert_eq!(published.grants.len(), 1);
}

/// Server rejects the compiled electrification: error forwarded
/// verbatim, transaction failed, client ROLLBACK recovers to idle.
#[test]
fn test_server_error_during_electrification_extended() {
    let mut h = Harness::new(&[]);

    // Explicit BEGIN, extended, passes through
    h.client(F::Parse {
        statement: String::new(),
        sql: "BEGIN".into(),
        param_types: vec![],
    });
    h.client(F::Bind {
        portal: String::new(),
        statement: String::new(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    h.client(F::Execute {
        portal: String::new(),
        max_rows: 0,
    });
    h.client(F::Sync);
    h.server_all(vec![
        B::ParseComplete,
        B::BindComplete,
        cc("BEGIN"),
        rfq(TS::InTransaction),
    ]);

    // The electrification DDL arrives as a Parse and is held back
    let out = h.client(F::Parse {
        statement: String::new(),
        sql: "ALTER TABLE something ENABLE ELECTRIC".into(),
        param_types: vec![],
    });
    assert!(out.server.is_empty());
    assert_eq!(out.client, vec![B::ParseComplete]);

    let out = h.client(F::Bind {
        portal: String::new(),
        statement: String::new(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    assert_eq!(out.client, vec![B::BindComplete]);

    let out = h.client(F::Execute {
        portal: String::new(),
        max_rows: 0,
    });
    let upstream = sqls(&out.server);
    assert!(is_introspection(&upstream[0]));
    h.client(F::Sync); // buffered until the command resolves

    let out = h.server_all(introspect_reply(true, false));
    assert_eq!(
        sqls(&out.server),
        vec!["CALL electric.electrify('public', 'something')"]
    );

    // The server refuses; the error must surface byte-identical
    let error = B::ErrorResponse {
        fields: vec![
            (b'S', "ERROR".into()),
            (b'C', "42501".into()),
            (b'M', "permission denied for schema electric".into()),
        ],
    };
    let out = h.server(error.clone());
    assert_eq!(out.client, vec![error]);

    let out = h.server(rfq(TS::Failed));
    // The buffered Sync now resolves with a failed status
    assert_eq!(out.client, vec![rfq(TS::Failed)]);

    // Client rolls back through the extended protocol
    h.client(F::Parse {
        statement: String::new(),
        sql: "ROLLBACK".into(),
        param_types: vec![],
    });
    h.client(F::Bind {
        portal: String::new(),
        statement: String::new(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    h.client(F::Execute {
        portal: String::new(),
        max_rows: 0,
    });
    h.client(F::Sync);
    let out = h.server_all(vec![
        B::ParseComplete,
        B::BindComplete,
        cc("ROLLBACK"),
        rfq(TS::Idle),
    ]);
    assert_eq!(
        out.client,
        vec![B::ParseComplete, B::BindComplete, cc("ROLLBACK"), rfq(TS::Idle)]
    );
}

/// A typo in an ELECTRIC command: rejected before any server traffic,
/// transaction failed, ROLLBACK recovers.
#[test]
fn test_malformed_ddlx_simple() {
    let mut h = Harness::new(&[]);
    h.begin_simple();
    let sent_before = h.sent.len();

    let out = h.client(query("ELECTRIC GRNT ALL ON projects TO 'member'"));
    assert!(out.server.is_empty(), "no server round trip for a parse error");
    assert_eq!(h.sent.len(), sent_before);
    assert_eq!(out.client.len(), 2);
    match &out.client[0] {
        B::ErrorResponse { fields } => {
            let code = fields.iter().find(|(t, _)| *t == b'C').unwrap();
            assert_eq!(code.1, "42601");
        }
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(out.client[1], rfq(TS::Failed));

    // Subsequent statements are refused until the rollback
    let out = h.client(query("SELECT 1"));
    assert!(out.server.is_empty());
    assert!(matches!(out.client[0], B::ErrorResponse { .. }));

    let out = h.client(query("ROLLBACK"));
    assert_eq!(sqls(&out.server), vec!["ROLLBACK"]);
    let out = h.server_all(vec![cc("ROLLBACK"), rfq(TS::Idle)]);
    assert_eq!(out.client, vec![cc("ROLLBACK"), rfq(TS::Idle)]);
}

// ---------------------------------------------------------------------
// Invariants and boundaries
// ---------------------------------------------------------------------

/// A single electrified DDL outside any transaction is wrapped in an
/// invisible BEGIN/COMMIT with the version capture inside.
#[test]
fn test_implicit_transaction_wrap() {
    let mut h = Harness::new(&["public.items"]);

    let out = h.client(query("ALTER TABLE items ADD COLUMN done boolean"));
    assert_eq!(sqls(&out.server), vec!["BEGIN"]);

    let out = h.server_all(vec![cc("BEGIN"), rfq(TS::InTransaction)]);
    assert!(out.client.is_empty(), "the wrapper BEGIN stays hidden");
    assert_eq!(sqls(&out.server), vec!["ALTER TABLE items ADD COLUMN done boolean"]);

    let out = h.server_all(vec![cc("ALTER TABLE"), rfq(TS::InTransaction)]);
    assert_eq!(out.client, vec![cc("ALTER TABLE")]);
    assert!(sqls(&out.server)[0].contains("test_versions"));

    let out = h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]);
    assert_eq!(sqls(&out.server), vec!["COMMIT"]);
    let out = h.server_all(vec![cc("COMMIT"), rfq(TS::Idle)]);
    // The client sees only its own statement completing, back at idle
    assert_eq!(out.client, vec![rfq(TS::Idle)]);
}

/// Within one transaction, one introspection round trip per table no
/// matter how many commands target it.
#[test]
fn test_schema_cache_one_introspection_per_table() {
    let mut h = Harness::new(&["public.projects"]);
    h.begin_simple();

    h.client(query("ELECTRIC GRANT READ ON projects TO 'viewer'"));
    h.server_all(introspect_reply(true, true));

    let out = h.client(query("ELECTRIC GRANT WRITE ON projects TO 'editor'"));
    assert!(out.server.is_empty(), "second command hits the schema cache");
    assert_eq!(out.client, vec![cc("ELECTRIC GRANT"), rfq(TS::InTransaction)]);

    let introspections = h.sent.iter().filter(|s| is_introspection(s)).count();
    assert_eq!(introspections, 1);
}

/// A command on a table the server does not know fails after exactly
/// one round trip.
#[test]
fn test_unknown_table_fails_after_one_round_trip() {
    let mut h = Harness::new(&[]);
    h.begin_simple();
    let sent_before = h.sent.len();

    h.client(query("ELECTRIC ENABLE missing"));
    // Reply stream for a nonexistent table: no column rows
    let out = h.server_all(vec![
        data_row(&[Some("electrified"), Some("f"), None, None, None, None]),
        cc("SELECT 1"),
        rfq(TS::InTransaction),
    ]);
    assert_eq!(h.sent.len(), sent_before + 1, "exactly one round trip");
    assert!(matches!(out.client[0], B::ErrorResponse { .. }));
    assert_eq!(out.client[1], rfq(TS::Failed));
}

/// Feature flags gate commands before anything reaches the server
#[test]
fn test_feature_disabled_rejected_locally() {
    let mut h = Harness::with_flags(&["public.projects"], FeatureFlags::none());
    h.begin_simple();

    let out = h.client(query("ELECTRIC GRANT ALL ON projects TO 'member'"));
    assert!(out.server.is_empty());
    match &out.client[0] {
        B::ErrorResponse { fields } => {
            let message = &fields.iter().find(|(t, _)| *t == b'M').unwrap().1;
            assert!(message.contains("proxy_ddlx_grant"), "{message}");
        }
        other => panic!("expected an error, got {other:?}"),
    }
}

/// ELECTRIC SQLITE alone still dirties the transaction: the version row
/// orders the statement in the downstream replication stream.
#[test]
fn test_sqlite_only_transaction_captures_version() {
    let mut h = Harness::new(&[]);
    h.begin_simple();

    let out = h.client(query("ELECTRIC SQLITE 'CREATE INDEX idx ON items (done)'"));
    assert!(out.server.is_empty(), "sqlite bodies never reach the server");
    assert_eq!(out.client, vec![cc("ELECTRIC SQLITE"), rfq(TS::InTransaction)]);

    let out = h.client(query("COMMIT"));
    assert!(sqls(&out.server)[0].contains("test_versions"));
    h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]);
    let out = h.server_all(vec![cc("COMMIT"), rfq(TS::Idle)]);
    assert_eq!(out.client, vec![cc("COMMIT"), rfq(TS::Idle)]);
    assert!(out
        .events
        .contains(&Event::SqliteCaptured("CREATE INDEX idx ON items (done)".into())));
}

/// An ecto-style version insert stamps the version-capture row
#[test]
fn test_framework_version_used_for_capture() {
    let mut h = Harness::new(&["public.users"]);
    h.begin_simple();

    let alter = "ALTER TABLE users ADD COLUMN email text";
    h.client(query(alter));
    h.server_all(vec![cc("ALTER TABLE"), rfq(TS::InTransaction)]);

    let insert =
        "INSERT INTO \"schema_migrations\" (version, inserted_at) VALUES (20240117103442, now())";
    let out = h.client(query(insert));
    assert_eq!(sqls(&out.server), vec![insert]);
    h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]);

    let out = h.client(query("COMMIT"));
    assert_eq!(
        sqls(&out.server),
        vec!["INSERT INTO test_versions (version) VALUES ('20240117103442')"]
    );
}

/// ENABLE ELECTRIC electrifies for the rest of the transaction and for
/// later sessions once committed.
#[test]
fn test_enable_registers_table_after_commit() {
    let mut h = Harness::new(&[]);
    h.begin_simple();

    h.client(query("ALTER TABLE items ENABLE ELECTRIC"));
    let out = h.server_all(introspect_reply(true, false));
    assert_eq!(
        sqls(&out.server),
        vec!["CALL electric.electrify('public', 'items')"]
    );
    let out = h.server_all(vec![cc("CALL"), rfq(TS::InTransaction)]);
    assert_eq!(out.client, vec![cc("ELECTRIC ENABLE"), rfq(TS::InTransaction)]);

    // Not yet visible to other sessions
    assert!(!h.registry.read().contains("public.items"));

    // But DDL on it inside this transaction already counts as electrified
    let alter = "ALTER TABLE items ADD COLUMN extra text";
    h.client(query(alter));
    h.server_all(vec![cc("ALTER TABLE"), rfq(TS::InTransaction)]);

    h.client(query("COMMIT"));
    h.server_all(vec![cc("INSERT 0 1"), rfq(TS::InTransaction)]);
    h.server_all(vec![cc("COMMIT"), rfq(TS::Idle)]);

    assert!(h.registry.read().contains("public.items"));
}

/// A failed version capture rolls the whole transaction back; nothing
/// is published.
#[test]
fn test_commit_pipeline_failure_rolls_back() {
    let mut h = Harness::new(&["public.projects"]);
    h.begin_simple();

    h.client(query("ELECTRIC GRANT READ ON projects TO 'viewer'"));
    h.server_all(introspect_reply(true, true));

    h.client(query("COMMIT"));
    let error = B::ErrorResponse {
        fields: vec![
            (b'S', "ERROR".into()),
            (b'C', "23505".into()),
            (b'M', "duplicate key value".into()),
        ],
    };
    let out = h.server(error.clone());
    assert_eq!(out.client, vec![error]);

    let out = h.server(rfq(TS::Failed));
    assert_eq!(sqls(&out.server), vec!["ROLLBACK"]);
    assert!(out.events.contains(&Event::ReleaseRules));

    let out = h.server_all(vec![cc("ROLLBACK"), rfq(TS::Idle)]);
    assert_eq!(out.client, vec![rfq(TS::Idle)]);

    assert!(h.rules.snapshot().is_empty(), "no rules published");
    assert_eq!(h.sent.iter().filter(|s| s.contains("test_rules")).count(), 0);
}

/// Mixed ELECTRIC + ordinary SQL in one batch is refused outright
#[test]
fn test_mixed_batch_rejected_without_server_traffic() {
    let mut h = Harness::new(&[]);
    h.begin_simple();

    let out = h.client(query("ELECTRIC ENABLE items; CREATE TABLE other (id int)"));
    assert!(out.server.is_empty());
    assert!(matches!(out.client[0], B::ErrorResponse { .. }));
    assert_eq!(out.client[1], rfq(TS::Failed));
}

/// Unsolicited server frames (parameter changes, notices) pass through
#[test]
fn test_unsolicited_frames_pass_through() {
    let mut h = Harness::new(&[]);
    let status = B::Other {
        tag: b'S',
        body: Bytes::from_static(b"TimeZone\0UTC\0"),
    };
    let out = h.server(status.clone());
    assert_eq!(out.client, vec![status]);

    let notice = B::NoticeResponse {
        fields: vec![(b'S', "NOTICE".into()), (b'M', "checkpoint".into())],
    };
    let out = h.server(notice.clone());
    assert_eq!(out.client, vec![notice]);
}

/// Extended DDLX synthesizes the full reply shape: ParseComplete,
/// BindComplete, parameter/no-data describes, the tagged completion.
#[test]
fn test_extended_protocol_ddlx_reply_shape() {
    let mut h = Harness::new(&["public.projects"]);

    // Open a transaction first (simple is fine for the server side)
    h.begin_simple();

    let out = h.client(F::Parse {
        statement: "s1".into(),
        sql: "ELECTRIC GRANT READ ON projects TO 'viewer'".into(),
        param_types: vec![],
    });
    assert_eq!(out.client, vec![B::ParseComplete]);
    assert!(out.server.is_empty());

    let out = h.client(F::Bind {
        portal: "p1".into(),
        statement: "s1".into(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    assert_eq!(out.client, vec![B::BindComplete]);

    let out = h.client(F::Describe {
        target: DescribeTarget::Statement,
        name: "s1".into(),
    });
    assert_eq!(
        out.client,
        vec![
            B::ParameterDescription { param_types: vec![] },
            B::NoData
        ]
    );

    let out = h.client(F::Execute {
        portal: "p1".into(),
        max_rows: 0,
    });
    assert!(is_introspection(&sqls(&out.server)[0]));

    h.client(F::Sync); // held until the command resolves

    let out = h.server_all(introspect_reply(true, true));
    // Completion, then the ready the held Sync was waiting for
    assert_eq!(out.client, vec![cc("ELECTRIC GRANT"), rfq(TS::InTransaction)]);
}
