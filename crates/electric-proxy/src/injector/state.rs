//! Injector state types
//!
//! Transaction state advances on ReadyForQuery frames from the server;
//! everything the proxy accumulates for the open transaction lives in
//! [`TxData`] and is dropped whenever the state returns to idle.

use std::collections::VecDeque;

use crate::ddlx::Command;
use crate::parser::ddl::TableRef;
use crate::permissions::Rules;
use crate::wire::TransactionStatus;

/// Injector-local transaction state
#[derive(Debug)]
pub enum TxState {
    Idle,
    InTx(TxData),
    /// An error ended the transaction; waiting for the client to roll back
    Failed,
}

impl TxState {
    pub fn is_idle(&self) -> bool {
        matches!(self, TxState::Idle)
    }

    pub fn tx_data(&mut self) -> Option<&mut TxData> {
        match self {
            TxState::InTx(data) => Some(data),
            _ => None,
        }
    }

    /// Status byte the *client* should see. An implicit wrapper
    /// transaction is invisible: the client stays Idle.
    pub fn client_status(&self) -> TransactionStatus {
        match self {
            TxState::Idle => TransactionStatus::Idle,
            TxState::InTx(data) if data.implicit => TransactionStatus::Idle,
            TxState::InTx(_) => TransactionStatus::InTransaction,
            TxState::Failed => TransactionStatus::Failed,
        }
    }
}

/// Everything accumulated for the open transaction
#[derive(Debug, Default)]
pub struct TxData {
    /// The proxy opened this transaction itself to wrap a single
    /// statement arriving outside an explicit transaction
    pub implicit: bool,
    /// An electrified DDL statement completed in this transaction
    pub electrified_ddl_seen: bool,
    /// At least one ELECTRIC command was processed
    pub ddlx_processed: bool,
    /// Folded rules awaiting the commit-time save, if any permission
    /// command ran
    pub permissions_dirty: Option<Rules>,
    /// Tables electrified in this transaction; published to the shared
    /// registry when the commit succeeds
    pub newly_electrified: Vec<String>,
    /// Tables un-electrified in this transaction
    pub un_electrified: Vec<String>,
    /// Captured ELECTRIC SQLITE bodies for downstream replay
    pub sqlite_bodies: Vec<String>,
    /// Version supplied by a migration framework marker
    pub version_hint: Option<String>,
}

impl TxData {
    pub fn implicit() -> Self {
        Self {
            implicit: true,
            ..Self::default()
        }
    }

    /// Whether commit must run the version-capture pipeline
    pub fn is_dirty(&self) -> bool {
        self.electrified_ddl_seen || self.ddlx_processed || self.permissions_dirty.is_some()
    }
}

/// How the reply stream of one upstream Query/Sync is treated
#[derive(Debug)]
pub enum ReplyCtx {
    /// Forward every frame, ReadyForQuery included
    Forward { marks: VecDeque<Mark> },
    /// Forward data frames but swallow the ReadyForQuery (the client's
    /// ready arrives later: at Sync, or after a wrapped commit)
    ForwardNoRfq { marks: VecDeque<Mark> },
    /// Hide the whole reply stream from the client; `errored` records a
    /// surfaced ErrorResponse until the stream's ReadyForQuery lands
    Silent { kind: SilentKind, errored: bool },
    /// The intercepted COMMIT itself: CommandComplete is forwarded when
    /// `visible`, ReadyForQuery finishes the pipeline
    CommitReply { visible: bool, errored: bool },
}

/// Per-statement annotation inside a forwarded reply stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    None,
    /// CommandComplete of this statement proves an electrified DDL ran
    ElectrifiedDdl(String),
}

/// What a silent reply stream belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SilentKind {
    /// Synthetic BEGIN wrapping an implicit transaction
    ImplicitBegin,
    /// Schema introspection; DataRows accumulate into the loader buffer
    Introspect,
    /// Compiled electrification SQL
    CompiledSql,
    /// Version-capture insert at commit
    VersionCapture,
    /// Rules-save upsert at commit
    RulesSave,
    /// Synthetic ROLLBACK issued for recovery; both sides come back
    /// idle once it resolves
    Rollback,
    /// Swallow the replies of a partially forwarded sync group after
    /// the proxy already failed the transaction; ReadyForQuery triggers
    /// the client-side ready and any deferred cleanup
    SyncDiscard,
}

/// Units of work queued for the current client request. Tasks run
/// strictly one at a time; each waits for the server replies its
/// predecessor provoked.
#[derive(Debug)]
pub enum Task {
    /// Open a transaction. Visible begins forward their completion to
    /// the client; implicit ones stay hidden.
    Begin { visible: bool },
    /// Forward one statement as its own Query, hiding the trailing
    /// ReadyForQuery (batch splitting / extended Execute)
    Statement { sql: String, mark: Mark },
    /// Run one ELECTRIC command to completion
    Ddlx(Command),
    /// Commit: version capture, rules save if dirty, then COMMIT
    Commit { visible: bool },
    /// Roll back. Visible rollbacks forward their completion.
    Rollback { visible: bool },
    /// Emit ReadyForQuery to the client from the current state
    EmitReady,
}

/// In-flight ELECTRIC command execution
#[derive(Debug)]
pub struct DdlxInFlight {
    pub command: Command,
    pub table: Option<TableRef>,
    /// DataRows accumulated from the introspection reply
    pub rows: Vec<Vec<Option<String>>>,
    /// Compiled statements not yet sent
    pub statements: VecDeque<String>,
}

/// In-flight intercepted commit
#[derive(Debug)]
pub struct CommitInFlight {
    /// Rules to publish once the COMMIT succeeds
    pub folded: Option<Rules>,
    /// Forward CommandComplete("COMMIT") to the client
    pub visible: bool,
}

/// What a prepared statement means to the proxy (extended protocol)
#[derive(Debug, Clone)]
pub enum Prepared {
    /// Forwarded verbatim; the classification drives Execute marking
    Passthrough(crate::parser::ddl::Statement),
    /// Parsed ELECTRIC command held by the proxy, never forwarded
    Electric(Command),
    /// Transaction control held by the proxy, replayed as simple Query
    TxControl(crate::parser::ddl::TxControl),
}
