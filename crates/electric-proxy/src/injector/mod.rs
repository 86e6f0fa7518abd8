//! The injector
//!
//! A deterministic per-connection state machine multiplexing the client
//! and server byte streams. Ordinary traffic passes through untouched;
//! electrified DDL is tracked; ELECTRIC commands are intercepted,
//! compiled and executed against the server under the covers; commits
//! of dirty transactions gain version-capture and rules-save writes the
//! client never sees.
//!
//! All logic here is synchronous over decoded frames. The session owns
//! the sockets and feeds frames in; every call returns the frames to
//! write on each side plus lock/publish events for the rules store.

pub mod queries;
pub mod scenario;
mod state;

#[cfg(test)]
mod tests;

pub use queries::{QueryGenerator, ServerQueryGenerator};
pub use scenario::{ProtocolMode, Scenario};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use electric_common::error::{sqlstate, ProxyError, Result};
use electric_common::features::FeatureFlags;

use crate::ddlx::{self, Command};
use crate::parser::classify_statement;
use crate::parser::ddl::{split_batch, Statement, TableRef, TxControl};
use crate::permissions::{self, RulesStore};
use crate::schema::loader::{introspection_query, parse_schema};
use crate::schema::SchemaCache;
use crate::wire::{BackendMessage, FrontendMessage, TransactionStatus};

use state::{
    CommitInFlight, DdlxInFlight, Mark, Prepared, ReplyCtx, SilentKind, Task, TxData, TxState,
};

/// Shared registry of electrified tables, keyed by `schema.table`
pub type ElectrifiedRegistry = Arc<RwLock<HashSet<String>>>;

/// Frames to emit and store events to run after one `handle_*` call
#[derive(Debug, Default)]
pub struct Actions {
    pub to_client: Vec<BackendMessage>,
    pub to_server: Vec<FrontendMessage>,
    pub events: Vec<Event>,
}

/// Side effects the session performs on the injector's behalf
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// Acquire the rules persist lock before the save statement runs
    LockRules,
    /// Release the persist lock; the commit resolved either way
    ReleaseRules,
    /// An ELECTRIC SQLITE body completed; hand it to the replication
    /// pipeline for satellite replay
    SqliteCaptured(String),
}

const ABORTED_TX_MESSAGE: &str =
    "current transaction is aborted, commands ignored until end of transaction block";

pub struct Injector {
    generator: Arc<dyn QueryGenerator>,
    flags: FeatureFlags,
    registry: ElectrifiedRegistry,
    rules: Arc<RulesStore>,

    scenario: Scenario,
    state: TxState,
    schema_cache: SchemaCache,

    /// Expected upstream reply streams, FIFO
    reply_queue: VecDeque<ReplyCtx>,
    /// Work queued for the current client request
    tasks: VecDeque<Task>,
    ddlx: Option<DdlxInFlight>,
    commit: Option<CommitInFlight>,
    /// Client frames deferred while synthetic work is in flight
    pending_client: VecDeque<FrontendMessage>,

    /// Extended-protocol bookkeeping
    prepared: HashMap<String, Prepared>,
    portals: HashMap<String, String>,
    /// Frames of the current sync group were forwarded upstream
    group_forwarded: bool,
    /// One mark per forwarded Execute/statement, popped per completion
    group_marks: VecDeque<Mark>,
    /// Skip client frames until Sync after an error (extended)
    ignore_till_sync: bool,

    /// Electrified-DDL completions seen before the transaction opened
    deferred_electrified: Vec<String>,
    /// The server entered the failed-transaction state itself
    server_failed: bool,
    /// The client is owed ReadyForQuery once recovery work drains
    owe_ready: bool,
    /// Completion tag owed to the client after a synthetic rollback
    owe_tag: Option<String>,
    /// The rules persist lock is held
    rules_locked: bool,
}

impl Injector {
    pub fn new(
        generator: Arc<dyn QueryGenerator>,
        flags: FeatureFlags,
        registry: ElectrifiedRegistry,
        rules: Arc<RulesStore>,
    ) -> Self {
        Self {
            generator,
            flags,
            registry,
            rules,
            scenario: Scenario::new(),
            state: TxState::Idle,
            schema_cache: SchemaCache::new(),
            reply_queue: VecDeque::new(),
            tasks: VecDeque::new(),
            ddlx: None,
            commit: None,
            pending_client: VecDeque::new(),
            prepared: HashMap::new(),
            portals: HashMap::new(),
            group_forwarded: false,
            group_marks: VecDeque::new(),
            ignore_till_sync: false,
            deferred_electrified: Vec::new(),
            server_failed: false,
            owe_ready: false,
            owe_tag: None,
            rules_locked: false,
        }
    }

    /// Synthetic upstream traffic is outstanding; the session applies
    /// the query timeout while this holds
    pub fn awaiting_synthetic(&self) -> bool {
        self.reply_queue
            .iter()
            .any(|ctx| matches!(ctx, ReplyCtx::Silent { .. } | ReplyCtx::CommitReply { .. }))
    }

    /// The rules persist lock should be held right now
    pub fn holds_rules_lock(&self) -> bool {
        self.rules_locked
    }

    fn busy(&self) -> bool {
        !self.tasks.is_empty()
            || self.ddlx.is_some()
            || self.commit.is_some()
            || !self.reply_queue.is_empty()
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    pub fn handle_client(&mut self, msg: FrontendMessage) -> Result<Actions> {
        let mut actions = Actions::default();
        if self.busy() {
            trace!("deferring client frame behind in-flight work");
            self.pending_client.push_back(msg);
            return Ok(actions);
        }
        self.dispatch_client(msg, &mut actions)?;
        Ok(actions)
    }

    fn dispatch_client(&mut self, msg: FrontendMessage, actions: &mut Actions) -> Result<()> {
        match msg {
            FrontendMessage::Query { sql } => {
                self.scenario.observe_protocol(ProtocolMode::Simple);
                self.handle_simple_query(sql, actions)
            }
            FrontendMessage::Parse {
                statement,
                sql,
                param_types,
            } => {
                self.scenario.observe_protocol(ProtocolMode::Extended);
                if self.ignore_till_sync {
                    return Ok(());
                }
                self.handle_parse(statement, sql, param_types, actions)
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                self.scenario.observe_protocol(ProtocolMode::Extended);
                if self.ignore_till_sync {
                    return Ok(());
                }
                self.handle_bind(portal, statement, param_formats, params, result_formats, actions)
            }
            FrontendMessage::Describe { target, name } => {
                self.scenario.observe_protocol(ProtocolMode::Extended);
                if self.ignore_till_sync {
                    return Ok(());
                }
                self.handle_describe(target, name, actions)
            }
            FrontendMessage::Execute { portal, max_rows } => {
                self.scenario.observe_protocol(ProtocolMode::Extended);
                if self.ignore_till_sync {
                    return Ok(());
                }
                self.handle_execute(portal, max_rows, actions)
            }
            FrontendMessage::Close { target, name } => {
                if self.ignore_till_sync {
                    return Ok(());
                }
                self.handle_close(target, name, actions)
            }
            FrontendMessage::Flush => {
                if self.group_forwarded {
                    actions.to_server.push(FrontendMessage::Flush);
                }
                Ok(())
            }
            FrontendMessage::Sync => {
                self.scenario.observe_protocol(ProtocolMode::Extended);
                self.handle_sync(actions)
            }
            FrontendMessage::Terminate => {
                actions.to_server.push(FrontendMessage::Terminate);
                Ok(())
            }
            other => {
                // COPY traffic and anything else flows through untouched
                actions.to_server.push(other);
                Ok(())
            }
        }
    }

    fn handle_simple_query(&mut self, sql: String, actions: &mut Actions) -> Result<()> {
        let parsed = match split_batch(&sql) {
            Ok(parsed) => parsed,
            Err(error) => return self.reject_client(error, actions),
        };

        if parsed.is_empty() {
            self.send_query_raw(sql, ReplyCtx::Forward { marks: VecDeque::new() }, actions);
            return Ok(());
        }

        // A failed transaction only accepts its own conclusion
        if matches!(self.state, TxState::Failed) {
            return self.handle_query_while_failed(sql, &parsed, actions);
        }

        // Everything is validated before any byte reaches the server
        for (_, stmt) in &parsed {
            if let Statement::Electric(cmd) = stmt {
                if let Err(error) = cmd.check_features(&self.flags) {
                    return self.reject_client(error, actions);
                }
            }
        }

        for (text, _) in &parsed {
            if let Some(version) = self.scenario.observe_statement(text) {
                if let Some(tx) = self.state.tx_data() {
                    tx.version_hint = Some(version);
                }
            }
        }

        let has_electric = parsed
            .iter()
            .any(|(_, s)| matches!(s, Statement::Electric(_)));
        let has_commit = parsed
            .iter()
            .any(|(_, s)| matches!(s, Statement::TxControl(TxControl::Commit)));
        let starts_with_begin = matches!(parsed[0].1, Statement::TxControl(TxControl::Begin));
        let electrified_in_batch = parsed.iter().any(|(_, s)| match s {
            Statement::PlainDdl { table, .. } => self.is_electrified(table),
            _ => false,
        });
        let dirty_now = matches!(&self.state, TxState::InTx(d) if d.is_dirty());

        let needs_split = has_electric
            || (has_commit && (dirty_now || electrified_in_batch))
            || (self.state.is_idle() && electrified_in_batch && !starts_with_begin);

        if !needs_split {
            let marks: VecDeque<Mark> = parsed.iter().map(|(_, s)| self.mark_for(s)).collect();
            self.send_query_raw(sql, ReplyCtx::Forward { marks }, actions);
            return Ok(());
        }

        let wrap = self.state.is_idle() && !starts_with_begin;
        if wrap {
            self.tasks.push_back(Task::Begin { visible: false });
        }
        for (text, stmt) in parsed {
            let task = match stmt {
                Statement::TxControl(TxControl::Begin) => Task::Begin { visible: true },
                Statement::TxControl(TxControl::Commit) => Task::Commit { visible: true },
                Statement::TxControl(TxControl::Rollback) => Task::Rollback { visible: true },
                Statement::Electric(cmd) => Task::Ddlx(cmd),
                Statement::PlainDdl { ref table, .. } if self.is_electrified(table) => {
                    Task::Statement {
                        sql: text,
                        mark: Mark::ElectrifiedDdl(table.key()),
                    }
                }
                _ => Task::Statement {
                    sql: text,
                    mark: Mark::None,
                },
            };
            self.tasks.push_back(task);
        }
        if wrap {
            self.tasks.push_back(Task::Commit { visible: false });
        }
        self.tasks.push_back(Task::EmitReady);
        self.advance_tasks(actions)
    }

    fn handle_query_while_failed(
        &mut self,
        sql: String,
        parsed: &[(String, Statement)],
        actions: &mut Actions,
    ) -> Result<()> {
        let single = parsed.len() == 1;
        match (single, &parsed[0].1) {
            (true, Statement::TxControl(TxControl::Rollback)) => {
                // The server resolves its own side whether it failed too
                // or was already rolled back underneath the client
                self.send_query_raw(sql, ReplyCtx::Forward { marks: VecDeque::new() }, actions);
                Ok(())
            }
            (true, Statement::TxControl(TxControl::Commit)) if self.server_failed => {
                self.send_query_raw(sql, ReplyCtx::Forward { marks: VecDeque::new() }, actions);
                Ok(())
            }
            (true, Statement::TxControl(TxControl::Commit)) => {
                // The upstream transaction is already gone; give the
                // client the COMMIT-in-failed-transaction outcome
                self.owe_tag = Some("ROLLBACK".into());
                self.owe_ready = true;
                self.send_query(
                    "ROLLBACK",
                    ReplyCtx::Silent {
                        kind: SilentKind::Rollback,
                        errored: false,
                    },
                    actions,
                );
                Ok(())
            }
            _ => {
                actions.to_client.push(BackendMessage::error(
                    sqlstate::IN_FAILED_SQL_TRANSACTION,
                    ABORTED_TX_MESSAGE,
                ));
                actions
                    .to_client
                    .push(ready(self.state.client_status()));
                Ok(())
            }
        }
    }

    fn handle_parse(
        &mut self,
        name: String,
        sql: String,
        param_types: Vec<i32>,
        actions: &mut Actions,
    ) -> Result<()> {
        let stmt = match classify_statement(&sql) {
            Ok(stmt) => stmt,
            Err(error) => return self.reject_client(error, actions),
        };

        if matches!(self.state, TxState::Failed)
            && !matches!(
                stmt,
                Statement::TxControl(TxControl::Rollback) | Statement::TxControl(TxControl::Commit)
            )
        {
            actions.to_client.push(BackendMessage::error(
                sqlstate::IN_FAILED_SQL_TRANSACTION,
                ABORTED_TX_MESSAGE,
            ));
            self.ignore_till_sync = true;
            return Ok(());
        }

        if let Some(version) = self.scenario.observe_statement(&sql) {
            if let Some(tx) = self.state.tx_data() {
                tx.version_hint = Some(version);
            }
        }

        let dirty_now = matches!(&self.state, TxState::InTx(d) if d.is_dirty());
        match stmt {
            Statement::Electric(cmd) => {
                if let Err(error) = cmd.check_features(&self.flags) {
                    return self.reject_client(error, actions);
                }
                debug!(command = %cmd.tag(), "holding ELECTRIC command from Parse");
                self.prepared.insert(name, Prepared::Electric(cmd));
                actions.to_client.push(BackendMessage::ParseComplete);
            }
            Statement::TxControl(TxControl::Commit) if dirty_now => {
                self.prepared
                    .insert(name, Prepared::TxControl(TxControl::Commit));
                actions.to_client.push(BackendMessage::ParseComplete);
            }
            stmt => {
                self.prepared.insert(name.clone(), Prepared::Passthrough(stmt));
                actions.to_server.push(FrontendMessage::Parse {
                    statement: name,
                    sql,
                    param_types,
                });
                self.group_forwarded = true;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_bind(
        &mut self,
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<bytes::Bytes>>,
        result_formats: Vec<i16>,
        actions: &mut Actions,
    ) -> Result<()> {
        match self.prepared.get(&statement) {
            Some(Prepared::Electric(_)) | Some(Prepared::TxControl(_)) => {
                self.portals.insert(portal, statement);
                actions.to_client.push(BackendMessage::BindComplete);
            }
            _ => {
                self.portals.insert(portal.clone(), statement.clone());
                actions.to_server.push(FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                });
                self.group_forwarded = true;
            }
        }
        Ok(())
    }

    fn handle_describe(
        &mut self,
        target: crate::wire::DescribeTarget,
        name: String,
        actions: &mut Actions,
    ) -> Result<()> {
        let ours = match target {
            crate::wire::DescribeTarget::Statement => self.prepared.get(&name),
            crate::wire::DescribeTarget::Portal => self
                .portals
                .get(&name)
                .and_then(|stmt| self.prepared.get(stmt)),
        };
        match ours {
            Some(Prepared::Electric(_)) | Some(Prepared::TxControl(_)) => {
                if matches!(target, crate::wire::DescribeTarget::Statement) {
                    actions
                        .to_client
                        .push(BackendMessage::ParameterDescription { param_types: vec![] });
                }
                actions.to_client.push(BackendMessage::NoData);
            }
            _ => {
                actions
                    .to_server
                    .push(FrontendMessage::Describe { target, name });
                self.group_forwarded = true;
            }
        }
        Ok(())
    }

    fn handle_execute(
        &mut self,
        portal: String,
        max_rows: i32,
        actions: &mut Actions,
    ) -> Result<()> {
        let resolved = self
            .portals
            .get(&portal)
            .and_then(|stmt| self.prepared.get(stmt))
            .cloned();

        match resolved {
            Some(Prepared::Electric(cmd)) => {
                if self.state.is_idle() {
                    self.tasks.push_back(Task::Begin { visible: false });
                    self.tasks.push_back(Task::Ddlx(cmd));
                    self.tasks.push_back(Task::Commit { visible: false });
                } else {
                    self.tasks.push_back(Task::Ddlx(cmd));
                }
                self.advance_tasks(actions)
            }
            Some(Prepared::TxControl(tc)) => {
                let task = match tc {
                    TxControl::Begin => Task::Begin { visible: true },
                    TxControl::Commit => Task::Commit { visible: true },
                    TxControl::Rollback => Task::Rollback { visible: true },
                };
                self.tasks.push_back(task);
                self.advance_tasks(actions)
            }
            Some(Prepared::Passthrough(stmt)) => {
                let mark = self.mark_for(&stmt);
                self.group_marks.push_back(mark);
                actions
                    .to_server
                    .push(FrontendMessage::Execute { portal, max_rows });
                self.group_forwarded = true;
                Ok(())
            }
            None => {
                self.group_marks.push_back(Mark::None);
                actions
                    .to_server
                    .push(FrontendMessage::Execute { portal, max_rows });
                self.group_forwarded = true;
                Ok(())
            }
        }
    }

    fn handle_close(
        &mut self,
        target: crate::wire::DescribeTarget,
        name: String,
        actions: &mut Actions,
    ) -> Result<()> {
        let ours = match target {
            crate::wire::DescribeTarget::Statement => matches!(
                self.prepared.get(&name),
                Some(Prepared::Electric(_)) | Some(Prepared::TxControl(_))
            ),
            crate::wire::DescribeTarget::Portal => self
                .portals
                .get(&name)
                .map(|stmt| {
                    matches!(
                        self.prepared.get(stmt),
                        Some(Prepared::Electric(_)) | Some(Prepared::TxControl(_))
                    )
                })
                .unwrap_or(false),
        };
        if ours {
            match target {
                crate::wire::DescribeTarget::Statement => {
                    self.prepared.remove(&name);
                }
                crate::wire::DescribeTarget::Portal => {
                    self.portals.remove(&name);
                }
            }
            actions.to_client.push(BackendMessage::CloseComplete);
        } else {
            actions
                .to_server
                .push(FrontendMessage::Close { target, name });
            self.group_forwarded = true;
        }
        Ok(())
    }

    fn handle_sync(&mut self, actions: &mut Actions) -> Result<()> {
        if self.ignore_till_sync {
            self.ignore_till_sync = false;
            if self.group_forwarded {
                self.group_forwarded = false;
                self.group_marks.clear();
                actions.to_server.push(FrontendMessage::Sync);
                self.reply_queue.push_back(ReplyCtx::Silent {
                    kind: SilentKind::SyncDiscard,
                    errored: false,
                });
            } else {
                actions.to_client.push(ready(self.state.client_status()));
            }
            return Ok(());
        }

        if self.group_forwarded {
            self.group_forwarded = false;
            let marks = std::mem::take(&mut self.group_marks);
            actions.to_server.push(FrontendMessage::Sync);
            self.reply_queue.push_back(ReplyCtx::Forward { marks });
        } else {
            self.group_marks.clear();
            actions.to_client.push(ready(self.state.client_status()));
        }
        Ok(())
    }

    /// Reject a client statement without any upstream traffic
    fn reject_client(&mut self, error: ProxyError, actions: &mut Actions) -> Result<()> {
        warn!(%error, "rejecting client statement");
        actions
            .to_client
            .push(BackendMessage::error(error.sqlstate(), error.to_string()));
        if matches!(&self.state, TxState::InTx(d) if !d.implicit) {
            self.state = TxState::Failed;
            self.server_failed = false;
        }
        if self.scenario.is_extended() {
            self.ignore_till_sync = true;
        } else {
            actions.to_client.push(ready(self.state.client_status()));
        }
        Ok(())
    }

    /// Fail the transaction while synthetic work was running
    fn fail_with(&mut self, error: ProxyError, actions: &mut Actions) {
        warn!(%error, "transaction failed during injected work");
        actions
            .to_client
            .push(BackendMessage::error(error.sqlstate(), error.to_string()));
        self.tasks.clear();
        self.ddlx = None;

        let implicit = matches!(&self.state, TxState::InTx(d) if d.implicit);
        if implicit {
            // The client never saw this transaction; clean it up and
            // come back idle
            self.owe_ready = !self.scenario.is_extended();
            self.send_query(
                "ROLLBACK",
                ReplyCtx::Silent {
                    kind: SilentKind::Rollback,
                    errored: false,
                },
                actions,
            );
            if self.scenario.is_extended() {
                self.ignore_till_sync = true;
            }
            return;
        }

        if matches!(self.state, TxState::InTx(_)) {
            self.state = TxState::Failed;
            self.server_failed = false;
        }
        if self.scenario.is_extended() {
            self.ignore_till_sync = true;
        } else {
            actions.to_client.push(ready(self.state.client_status()));
        }
    }

    // ------------------------------------------------------------------
    // Task pump
    // ------------------------------------------------------------------

    fn advance_tasks(&mut self, actions: &mut Actions) -> Result<()> {
        while self.reply_queue.is_empty() && self.ddlx.is_none() && self.commit.is_none() {
            let Some(task) = self.tasks.pop_front() else {
                break;
            };
            match task {
                Task::Begin { visible } => {
                    let ctx = if visible {
                        ReplyCtx::ForwardNoRfq {
                            marks: VecDeque::from([Mark::None]),
                        }
                    } else {
                        debug!("opening implicit transaction");
                        ReplyCtx::Silent {
                            kind: SilentKind::ImplicitBegin,
                            errored: false,
                        }
                    };
                    self.send_query("BEGIN", ctx, actions);
                }
                Task::Statement { sql, mark } => {
                    let ctx = ReplyCtx::ForwardNoRfq {
                        marks: VecDeque::from([mark]),
                    };
                    self.send_query_raw(sql, ctx, actions);
                }
                Task::Ddlx(cmd) => self.start_ddlx(cmd, actions)?,
                Task::Commit { visible } => self.run_commit(visible, actions),
                Task::Rollback { visible } => {
                    let ctx = if visible {
                        ReplyCtx::ForwardNoRfq {
                            marks: VecDeque::from([Mark::None]),
                        }
                    } else {
                        ReplyCtx::Silent {
                            kind: SilentKind::Rollback,
                            errored: false,
                        }
                    };
                    self.send_query("ROLLBACK", ctx, actions);
                }
                Task::EmitReady => {
                    actions.to_client.push(ready(self.state.client_status()));
                }
            }
        }
        if !self.busy() {
            self.drain_pending(actions)?;
        }
        Ok(())
    }

    fn drain_pending(&mut self, actions: &mut Actions) -> Result<()> {
        while !self.busy() {
            let Some(msg) = self.pending_client.pop_front() else {
                break;
            };
            self.dispatch_client(msg, actions)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // ELECTRIC command execution
    // ------------------------------------------------------------------

    fn start_ddlx(&mut self, command: Command, actions: &mut Actions) -> Result<()> {
        if let Some(tx) = self.state.tx_data() {
            tx.ddlx_processed = true;
        }

        if let Command::SqliteVerbatim { body } = &command {
            debug!("captured ELECTRIC SQLITE body");
            if let Some(tx) = self.state.tx_data() {
                tx.sqlite_bodies.push(body.clone());
            }
            actions.to_client.push(BackendMessage::CommandComplete {
                tag: command.tag().to_string(),
            });
            return Ok(());
        }

        let table = command
            .target_table()
            .expect("every non-SQLITE command names a target")
            .clone();

        if let Some(schema) = self.schema_cache.get(&table).cloned() {
            trace!(table = %table, "schema cache hit");
            self.continue_ddlx(command, schema, actions);
            return Ok(());
        }

        debug!(table = %table, "introspecting target table");
        let sql = introspection_query(&table);
        self.ddlx = Some(DdlxInFlight {
            command,
            table: Some(table),
            rows: Vec::new(),
            statements: VecDeque::new(),
        });
        self.send_query(
            &sql,
            ReplyCtx::Silent {
                kind: SilentKind::Introspect,
                errored: false,
            },
            actions,
        );
        Ok(())
    }

    fn finish_introspect(&mut self, actions: &mut Actions) {
        let Some(inflight) = self.ddlx.take() else {
            return;
        };
        let table = inflight.table.clone().expect("introspection has a table");
        match parse_schema(&table, &inflight.rows) {
            Ok(schema) => {
                self.schema_cache.insert(&table, schema.clone());
                self.continue_ddlx(inflight.command, schema, actions);
            }
            Err(error) => self.fail_with(error, actions),
        }
    }

    fn continue_ddlx(
        &mut self,
        command: Command,
        schema: crate::schema::TableSchema,
        actions: &mut Actions,
    ) {
        match &command {
            Command::Enable { .. } | Command::Disable { .. } => {
                match ddlx::compile(&command, Some(&schema)) {
                    Ok(compiled) => {
                        let mut statements: VecDeque<String> = compiled.statements.into();
                        let Some(first) = statements.pop_front() else {
                            self.complete_ddlx(command, actions);
                            return;
                        };
                        self.ddlx = Some(DdlxInFlight {
                            command,
                            table: None,
                            rows: Vec::new(),
                            statements,
                        });
                        self.send_query(
                            &first,
                            ReplyCtx::Silent {
                                kind: SilentKind::CompiledSql,
                                errored: false,
                            },
                            actions,
                        );
                    }
                    Err(error) => self.fail_with(error, actions),
                }
            }
            Command::Grant { .. }
            | Command::Revoke { .. }
            | Command::Assign { .. }
            | Command::Unassign { .. } => {
                let base = match self.state.tx_data().and_then(|tx| tx.permissions_dirty.clone()) {
                    Some(rules) => rules,
                    None => self.rules.snapshot(),
                };
                match permissions::apply(&base, &command, Some(&schema)) {
                    Ok(folded) => {
                        if let Some(tx) = self.state.tx_data() {
                            tx.permissions_dirty = Some(folded);
                        }
                        self.complete_ddlx(command, actions);
                    }
                    Err(error) => self.fail_with(error, actions),
                }
            }
            Command::SqliteVerbatim { .. } => unreachable!("handled before introspection"),
        }
    }

    fn next_compiled_or_complete(&mut self, actions: &mut Actions) -> Result<()> {
        let Some(mut inflight) = self.ddlx.take() else {
            return Ok(());
        };
        if let Some(next) = inflight.statements.pop_front() {
            self.ddlx = Some(inflight);
            self.send_query(
                &next,
                ReplyCtx::Silent {
                    kind: SilentKind::CompiledSql,
                    errored: false,
                },
                actions,
            );
            return Ok(());
        }

        // Electrification completed server-side; reflect it locally so
        // later commands in this transaction see the new status
        match &inflight.command {
            Command::Enable { table } => {
                if let Some(tx) = self.state.tx_data() {
                    tx.newly_electrified.push(table.key());
                }
                self.schema_cache.set_electrified(table, true);
            }
            Command::Disable { table } => {
                if let Some(tx) = self.state.tx_data() {
                    tx.un_electrified.push(table.key());
                }
                self.schema_cache.set_electrified(table, false);
            }
            _ => {}
        }
        self.complete_ddlx(inflight.command, actions);
        self.advance_tasks(actions)
    }

    fn complete_ddlx(&mut self, command: Command, actions: &mut Actions) {
        debug!(command = %command.tag(), "ELECTRIC command complete");
        actions.to_client.push(BackendMessage::CommandComplete {
            tag: command.tag().to_string(),
        });
        self.ddlx = None;
    }

    // ------------------------------------------------------------------
    // Commit pipeline
    // ------------------------------------------------------------------

    fn run_commit(&mut self, visible: bool, actions: &mut Actions) {
        let dirty = matches!(&self.state, TxState::InTx(d) if d.is_dirty());
        if !dirty {
            self.commit = Some(CommitInFlight {
                folded: None,
                visible,
            });
            self.send_query("COMMIT", ReplyCtx::CommitReply { visible, errored: false }, actions);
            return;
        }

        let (folded, version) = {
            let tx = self.state.tx_data().expect("dirty implies open transaction");
            let folded = tx.permissions_dirty.clone();
            let version = tx
                .version_hint
                .clone()
                .unwrap_or_else(|| self.generator.generate_version());
            (folded, version)
        };

        if folded.is_some() && !self.rules_locked {
            actions.events.push(Event::LockRules);
            self.rules_locked = true;
        }

        debug!(version = %version, permissions = folded.is_some(), "intercepting COMMIT");
        self.commit = Some(CommitInFlight {
            folded,
            visible,
        });
        let sql = self.generator.capture_version(&version);
        self.send_query(
            &sql,
            ReplyCtx::Silent {
                kind: SilentKind::VersionCapture,
                errored: false,
            },
            actions,
        );
    }

    fn after_version_capture(&mut self, actions: &mut Actions) {
        let folded = self.commit.as_ref().and_then(|c| c.folded.clone());
        match folded {
            Some(rules) => {
                let sql = self.generator.save_rules(&rules);
                self.send_query(
                    &sql,
                    ReplyCtx::Silent {
                        kind: SilentKind::RulesSave,
                        errored: false,
                    },
                    actions,
                );
            }
            None => self.send_final_commit(actions),
        }
    }

    fn send_final_commit(&mut self, actions: &mut Actions) {
        let visible = self.commit.as_ref().map(|c| c.visible).unwrap_or(true);
        self.send_query(
            "COMMIT",
            ReplyCtx::CommitReply {
                visible,
                errored: false,
            },
            actions,
        );
    }

    fn finalize_commit(&mut self, actions: &mut Actions) -> Result<()> {
        let commit = self.commit.take();
        let data = match std::mem::replace(&mut self.state, TxState::Idle) {
            TxState::InTx(data) => data,
            _ => TxData::default(),
        };

        {
            let mut registry = self.registry.write();
            for key in &data.newly_electrified {
                debug!(table = %key, "table electrified");
                registry.insert(key.clone());
            }
            for key in &data.un_electrified {
                debug!(table = %key, "table un-electrified");
                registry.remove(key);
            }
        }

        if let Some(folded) = commit.and_then(|c| c.folded) {
            self.rules.publish(folded);
        }
        if self.rules_locked {
            self.rules_locked = false;
            actions.events.push(Event::ReleaseRules);
        }
        for body in data.sqlite_bodies {
            actions.events.push(Event::SqliteCaptured(body));
        }

        self.clear_tx_scoped();
        self.advance_tasks(actions)
    }

    fn commit_failed(&mut self, actions: &mut Actions) {
        // Nothing of the dirty transaction may survive a failed commit
        self.commit = None;
        self.tasks.clear();
        if self.rules_locked {
            self.rules_locked = false;
            actions.events.push(Event::ReleaseRules);
        }
        self.owe_ready = !self.scenario.is_extended();
        self.send_query(
            "ROLLBACK",
            ReplyCtx::Silent {
                kind: SilentKind::Rollback,
                errored: false,
            },
            actions,
        );
    }

    // ------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------

    pub fn handle_server(&mut self, msg: BackendMessage) -> Result<Actions> {
        let mut actions = Actions::default();
        match self.reply_queue.pop_front() {
            None => self.unsolicited(msg, &mut actions)?,
            Some(ctx) => self.on_reply(ctx, msg, &mut actions)?,
        }
        Ok(actions)
    }

    fn unsolicited(&mut self, msg: BackendMessage, actions: &mut Actions) -> Result<()> {
        if let BackendMessage::ReadyForQuery { status } = msg {
            self.apply_status(status, true, actions);
            self.advance_tasks(actions)
        } else {
            actions.to_client.push(msg);
            Ok(())
        }
    }

    fn on_reply(
        &mut self,
        mut ctx: ReplyCtx,
        msg: BackendMessage,
        actions: &mut Actions,
    ) -> Result<()> {
        // ReadyForQuery always ends the current reply stream
        if let BackendMessage::ReadyForQuery { status } = msg {
            return self.reply_stream_done(ctx, status, actions);
        }

        match &mut ctx {
            ReplyCtx::Forward { marks } | ReplyCtx::ForwardNoRfq { marks } => match msg {
                BackendMessage::CommandComplete { tag } => {
                    let mark = marks.pop_front();
                    self.apply_mark(mark);
                    actions
                        .to_client
                        .push(BackendMessage::CommandComplete { tag });
                }
                BackendMessage::EmptyQueryResponse | BackendMessage::PortalSuspended => {
                    marks.pop_front();
                    actions.to_client.push(msg);
                }
                other => {
                    actions.to_client.push(other);
                }
            },
            ReplyCtx::Silent { kind, errored } => match msg {
                BackendMessage::NoticeResponse { fields } => {
                    actions
                        .to_client
                        .push(BackendMessage::NoticeResponse { fields });
                }
                BackendMessage::ErrorResponse { .. } => {
                    warn!(
                        error = msg.primary_message().unwrap_or("unknown"),
                        "server rejected an injected statement"
                    );
                    // Surfaced verbatim; the transaction is over
                    if !matches!(kind, SilentKind::SyncDiscard | SilentKind::Rollback) {
                        actions.to_client.push(msg);
                    }
                    *errored = true;
                }
                BackendMessage::DataRow { values } => {
                    if matches!(kind, SilentKind::Introspect) {
                        if let Some(inflight) = self.ddlx.as_mut() {
                            inflight.rows.push(decode_row(&values));
                        }
                    }
                }
                _ => {}
            },
            ReplyCtx::CommitReply { visible, errored } => match msg {
                BackendMessage::CommandComplete { tag } => {
                    if *visible {
                        actions
                            .to_client
                            .push(BackendMessage::CommandComplete { tag });
                    }
                }
                BackendMessage::NoticeResponse { fields } => {
                    actions
                        .to_client
                        .push(BackendMessage::NoticeResponse { fields });
                }
                BackendMessage::ErrorResponse { fields } => {
                    actions
                        .to_client
                        .push(BackendMessage::ErrorResponse { fields });
                    *errored = true;
                }
                _ => {}
            },
        }

        self.reply_queue.push_front(ctx);
        Ok(())
    }

    fn reply_stream_done(
        &mut self,
        ctx: ReplyCtx,
        status: TransactionStatus,
        actions: &mut Actions,
    ) -> Result<()> {
        match ctx {
            ReplyCtx::Forward { .. } => {
                self.apply_status(status, true, actions);
                self.advance_tasks(actions)
            }
            ReplyCtx::ForwardNoRfq { .. } => {
                self.apply_status(status, false, actions);
                if matches!(status, TransactionStatus::Failed) {
                    // A statement in the split batch failed; drop the
                    // rest and close out the client's request
                    self.tasks.clear();
                    self.ddlx = None;
                    self.commit = None;
                    if self.scenario.is_extended() {
                        self.ignore_till_sync = true;
                    } else {
                        actions.to_client.push(ready(self.state.client_status()));
                    }
                    self.drain_pending(actions)
                } else {
                    self.advance_tasks(actions)
                }
            }
            ReplyCtx::Silent { kind, errored } => self.finish_silent(kind, errored, status, actions),
            ReplyCtx::CommitReply { errored, .. } => {
                if errored {
                    self.commit_failed(actions);
                    Ok(())
                } else {
                    self.finalize_commit(actions)
                }
            }
        }
    }

    fn finish_silent(
        &mut self,
        kind: SilentKind,
        errored: bool,
        status: TransactionStatus,
        actions: &mut Actions,
    ) -> Result<()> {
        if errored {
            return self.silent_errored(kind, actions);
        }
        match kind {
            SilentKind::ImplicitBegin => {
                self.state = TxState::InTx(TxData::implicit());
                self.advance_tasks(actions)
            }
            SilentKind::Introspect => {
                self.finish_introspect(actions);
                self.advance_tasks(actions)
            }
            SilentKind::CompiledSql => self.next_compiled_or_complete(actions),
            SilentKind::VersionCapture => {
                self.after_version_capture(actions);
                Ok(())
            }
            SilentKind::RulesSave => {
                self.send_final_commit(actions);
                Ok(())
            }
            SilentKind::Rollback => self.rollback_finished(actions),
            SilentKind::SyncDiscard => {
                let _ = status;
                actions.to_client.push(ready(self.state.client_status()));
                self.drain_pending(actions)
            }
        }
    }

    fn silent_errored(&mut self, kind: SilentKind, actions: &mut Actions) -> Result<()> {
        match kind {
            SilentKind::ImplicitBegin | SilentKind::Introspect | SilentKind::CompiledSql => {
                self.ddlx = None;
                self.tasks.clear();
                let implicit = matches!(&self.state, TxState::InTx(d) if d.implicit);
                if implicit {
                    self.owe_ready = !self.scenario.is_extended();
                    self.send_query(
                        "ROLLBACK",
                        ReplyCtx::Silent {
                            kind: SilentKind::Rollback,
                            errored: false,
                        },
                        actions,
                    );
                    return Ok(());
                }
                self.state = TxState::Failed;
                self.server_failed = true;
                if self.scenario.is_extended() {
                    self.ignore_till_sync = true;
                } else {
                    actions.to_client.push(ready(self.state.client_status()));
                }
                self.drain_pending(actions)
            }
            SilentKind::VersionCapture | SilentKind::RulesSave => {
                // The atomic tail of the commit broke; roll everything back
                self.commit_failed(actions);
                Ok(())
            }
            SilentKind::Rollback => {
                warn!("synthetic ROLLBACK errored; treating transaction as closed");
                self.rollback_finished(actions)
            }
            SilentKind::SyncDiscard => {
                actions.to_client.push(ready(self.state.client_status()));
                self.drain_pending(actions)
            }
        }
    }

    fn rollback_finished(&mut self, actions: &mut Actions) -> Result<()> {
        self.state = TxState::Idle;
        self.clear_tx_scoped();
        if self.rules_locked {
            self.rules_locked = false;
            actions.events.push(Event::ReleaseRules);
        }
        if let Some(tag) = self.owe_tag.take() {
            actions
                .to_client
                .push(BackendMessage::CommandComplete { tag });
        }
        if self.owe_ready {
            self.owe_ready = false;
            actions.to_client.push(ready(self.state.client_status()));
        }
        self.advance_tasks(actions)
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn apply_status(
        &mut self,
        status: TransactionStatus,
        forward: bool,
        actions: &mut Actions,
    ) {
        match status {
            TransactionStatus::Idle => {
                self.state = TxState::Idle;
                self.server_failed = false;
                self.clear_tx_scoped();
                if self.rules_locked {
                    self.rules_locked = false;
                    actions.events.push(Event::ReleaseRules);
                }
            }
            TransactionStatus::InTransaction => {
                if self.state.tx_data().is_none() {
                    self.state = TxState::InTx(TxData::default());
                }
                if !self.deferred_electrified.is_empty() {
                    if let Some(tx) = self.state.tx_data() {
                        tx.electrified_ddl_seen = true;
                    }
                    self.deferred_electrified.clear();
                }
            }
            TransactionStatus::Failed => {
                self.state = TxState::Failed;
                self.server_failed = true;
                self.clear_tx_scoped();
                if self.rules_locked {
                    self.rules_locked = false;
                    actions.events.push(Event::ReleaseRules);
                }
            }
        }
        if forward {
            actions.to_client.push(ready(status));
        }
    }

    fn apply_mark(&mut self, mark: Option<Mark>) {
        if let Some(Mark::ElectrifiedDdl(key)) = mark {
            debug!(table = %key, "electrified DDL completed");
            match self.state.tx_data() {
                Some(tx) => tx.electrified_ddl_seen = true,
                None => self.deferred_electrified.push(key),
            }
        }
    }

    fn mark_for(&self, stmt: &Statement) -> Mark {
        match stmt {
            Statement::PlainDdl { table, .. } if self.is_electrified(table) => {
                Mark::ElectrifiedDdl(table.key())
            }
            _ => Mark::None,
        }
    }

    fn is_electrified(&self, table: &TableRef) -> bool {
        let key = table.key();
        if self.registry.read().contains(&key) {
            return true;
        }
        matches!(&self.state, TxState::InTx(d) if d.newly_electrified.contains(&key))
    }

    fn clear_tx_scoped(&mut self) {
        self.schema_cache.clear();
        self.deferred_electrified.clear();
    }

    fn send_query(&mut self, sql: &str, ctx: ReplyCtx, actions: &mut Actions) {
        self.send_query_raw(sql.to_string(), ctx, actions);
    }

    fn send_query_raw(&mut self, sql: String, ctx: ReplyCtx, actions: &mut Actions) {
        trace!(sql = %sql.chars().take(120).collect::<String>(), "upstream query");
        actions.to_server.push(FrontendMessage::Query { sql });
        self.reply_queue.push_back(ctx);
    }
}

fn ready(status: TransactionStatus) -> BackendMessage {
    BackendMessage::ReadyForQuery { status }
}

fn decode_row(values: &[Option<bytes::Bytes>]) -> Vec<Option<String>> {
    values
        .iter()
        .map(|v| {
            v.as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        })
        .collect()
}
