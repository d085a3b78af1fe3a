//! Test support utilities shared across unit and integration tests.
//!
//! Provides a scripted SSH command runner, an in-memory Robot API fake, an
//! in-memory state store and an environment guard for configuration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::resource::{ManagedServerState, StateStore, StateStoreError};
use crate::robot::{
    MarketOrderRequest, ProductRef, Rescue, RescueRequest, ResetKind, RobotApi, RobotError,
    RobotFuture, Server, ServerOrderRequest, Transaction, TransactionStatus, VSwitch,
};
use crate::session::{CommandOutput, CommandRunner, SessionError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic SSH outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes written to standard input, when any.
    pub input: Option<Vec<u8>>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the final argument, which carries the remote command for
    /// SSH invocations.
    #[must_use]
    pub fn remote_command(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes `count` successful exit statuses.
    pub fn push_successes(&self, count: usize) {
        for _ in 0..count {
            self.push_success();
        }
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn respond(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, SessionError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            input: input.map(<[u8]>::to_vec),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| SessionError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SessionError> {
        self.respond(program, args, None)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        input: &[u8],
    ) -> Result<CommandOutput, SessionError> {
        self.respond(program, args, Some(input))
    }
}

/// Builds a transaction with the given id and status.
#[must_use]
pub fn transaction(id: &str, status: TransactionStatus) -> Transaction {
    Transaction {
        id: id.to_owned(),
        date: String::from("2025-01-01T00:00:00+01:00"),
        status,
        server_number: (status == TransactionStatus::Ready).then_some(321_654),
        server_ip: (status == TransactionStatus::Ready).then(|| String::from("203.0.113.7")),
        product: None,
        addons: Vec::new(),
    }
}

/// Builds a ready server summary.
#[must_use]
pub fn server(server_number: u32, name: &str, server_ip: &str) -> Server {
    Server {
        server_number,
        server_name: name.to_owned(),
        server_ip: Some(server_ip.to_owned()),
        status: String::from("ready"),
        product: String::from("EX44"),
        location: String::from("FSN1"),
        cancelled: false,
    }
}

#[derive(Debug, Default)]
struct FakeRobotState {
    calls: Vec<String>,
    failing: BTreeSet<&'static str>,
    order_response: Option<Transaction>,
    transactions: HashMap<String, VecDeque<Transaction>>,
    market_transactions: HashMap<String, VecDeque<Transaction>>,
    servers: Vec<Server>,
    vswitches: BTreeMap<u32, VSwitch>,
    next_vswitch_id: u32,
}

/// In-memory [`RobotApi`] that records every call.
///
/// Verbs registered with [`FakeRobot::fail_on`] answer with an HTTP 500 API
/// error. Lookups of unknown objects answer with not-found.
#[derive(Debug, Default)]
pub struct FakeRobot {
    state: StdMutex<FakeRobotState>,
}

impl FakeRobot {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StdMutexGuard<'_, FakeRobotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every future call of `verb` fail.
    pub fn fail_on(&self, verb: &'static str) {
        self.lock().failing.insert(verb);
    }

    /// Lets calls of `verb` succeed again.
    pub fn recover(&self, verb: &str) {
        self.lock().failing.remove(verb);
    }

    /// Returns the recorded calls, one line per call, verb first.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Counts the recorded calls of `verb`.
    #[must_use]
    pub fn call_count(&self, verb: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(verb))
            .count()
    }

    /// Sets the transaction returned when placing either kind of order.
    pub fn set_order_response(&self, transaction: Transaction) {
        self.lock().order_response = Some(transaction);
    }

    /// Queues standard order transaction snapshots. Each lookup consumes
    /// one snapshot until the last, which is then returned indefinitely.
    pub fn push_transactions(&self, id: &str, snapshots: impl IntoIterator<Item = Transaction>) {
        self.lock()
            .transactions
            .entry(id.to_owned())
            .or_default()
            .extend(snapshots);
    }

    /// Queues market order transaction snapshots.
    pub fn push_market_transactions(
        &self,
        id: &str,
        snapshots: impl IntoIterator<Item = Transaction>,
    ) {
        self.lock()
            .market_transactions
            .entry(id.to_owned())
            .or_default()
            .extend(snapshots);
    }

    /// Replaces the server listing.
    pub fn set_servers(&self, servers: Vec<Server>) {
        self.lock().servers = servers;
    }

    /// Adds an existing virtual switch.
    pub fn insert_vswitch(&self, vswitch: VSwitch) {
        let mut state = self.lock();
        state.next_vswitch_id = state.next_vswitch_id.max(vswitch.id);
        state.vswitches.insert(vswitch.id, vswitch);
    }

    /// Returns the switches currently known to the fake.
    #[must_use]
    pub fn vswitches(&self) -> Vec<VSwitch> {
        self.lock().vswitches.values().cloned().collect()
    }

    fn call<T, F>(&self, verb: &'static str, detail: String, op: F) -> Result<T, RobotError>
    where
        F: FnOnce(&mut FakeRobotState) -> Result<T, RobotError>,
    {
        let mut state = self.lock();
        let line = if detail.is_empty() {
            verb.to_owned()
        } else {
            format!("{verb} {detail}")
        };
        state.calls.push(line);
        if state.failing.contains(verb) {
            return Err(RobotError::Api {
                status: 500,
                code: String::from("INTERNAL_ERROR"),
                message: format!("{verb} rejected"),
            });
        }
        op(&mut state)
    }

    fn respond<'a, T: Send + 'a>(result: Result<T, RobotError>) -> RobotFuture<'a, T> {
        Box::pin(future::ready(result))
    }
}

fn not_found(path: String) -> RobotError {
    RobotError::NotFound { path }
}

fn next_snapshot(
    queue: Option<&mut VecDeque<Transaction>>,
    path: String,
) -> Result<Transaction, RobotError> {
    let Some(snapshots) = queue else {
        return Err(not_found(path));
    };
    let next = if snapshots.len() > 1 {
        snapshots.pop_front()
    } else {
        snapshots.front().cloned()
    };
    next.ok_or_else(|| not_found(path))
}

fn placed_order(state: &mut FakeRobotState, product: &str) -> Transaction {
    state.order_response.clone().unwrap_or_else(|| {
        let mut placed = transaction("B20250101-0000001-1", TransactionStatus::InProcess);
        placed.product = Some(ProductRef::Name(product.to_owned()));
        placed
    })
}

impl RobotApi for FakeRobot {
    fn order_server<'a>(&'a self, order: &'a ServerOrderRequest) -> RobotFuture<'a, Transaction> {
        Self::respond(self.call("order_server", order.product_id.clone(), |state| {
            Ok(placed_order(state, &order.product_id))
        }))
    }

    fn get_order_transaction<'a>(&'a self, id: &'a str) -> RobotFuture<'a, Transaction> {
        Self::respond(self.call("get_order_transaction", id.to_owned(), |state| {
            next_snapshot(
                state.transactions.get_mut(id),
                format!("/order/server/transaction/{id}"),
            )
        }))
    }

    fn order_market_server<'a>(
        &'a self,
        order: &'a MarketOrderRequest,
    ) -> RobotFuture<'a, Transaction> {
        let product = order.product_id.to_string();
        Self::respond(self.call("order_market_server", product.clone(), |state| {
            Ok(placed_order(state, &product))
        }))
    }

    fn get_market_transaction<'a>(&'a self, id: &'a str) -> RobotFuture<'a, Transaction> {
        Self::respond(self.call("get_market_transaction", id.to_owned(), |state| {
            next_snapshot(
                state.market_transactions.get_mut(id),
                format!("/order/server_market/transaction/{id}"),
            )
        }))
    }

    fn activate_rescue<'a>(
        &'a self,
        server_number: u32,
        request: &'a RescueRequest,
    ) -> RobotFuture<'a, Rescue> {
        let detail = format!("{server_number} {}", request.authorized_keys.join(","));
        Self::respond(self.call("activate_rescue", detail, |_| {
            Ok(Rescue {
                server_ip: String::from("203.0.113.7"),
                active: true,
                password: None,
                authorized_key: Vec::new(),
            })
        }))
    }

    fn reset(&self, server_number: u32, kind: ResetKind) -> RobotFuture<'_, ()> {
        let detail = format!("{server_number} {}", kind.as_str());
        Self::respond(self.call("reset", detail, |_| Ok(())))
    }

    fn set_server_name<'a>(&'a self, server_number: u32, name: &'a str) -> RobotFuture<'a, ()> {
        let detail = format!("{server_number} {name}");
        Self::respond(self.call("set_server_name", detail, |state| {
            if let Some(found) = state
                .servers
                .iter_mut()
                .find(|candidate| candidate.server_number == server_number)
            {
                name.clone_into(&mut found.server_name);
            }
            Ok(())
        }))
    }

    fn cancel_server<'a>(
        &'a self,
        server_number: u32,
        cancellation_date: Option<&'a str>,
    ) -> RobotFuture<'a, ()> {
        let detail = format!("{server_number} {}", cancellation_date.unwrap_or("now"));
        Self::respond(self.call("cancel_server", detail, |_| Ok(())))
    }

    fn add_server_to_vswitch(&self, vswitch_id: u32, server_ip: IpAddr) -> RobotFuture<'_, ()> {
        let detail = format!("{vswitch_id} {server_ip}");
        Self::respond(self.call("add_server_to_vswitch", detail, |_| Ok(())))
    }

    fn create_vswitch<'a>(&'a self, vlan: u16, name: &'a str) -> RobotFuture<'a, VSwitch> {
        let detail = format!("{vlan} {name}");
        Self::respond(self.call("create_vswitch", detail, |state| {
            state.next_vswitch_id += 1;
            let created = VSwitch {
                id: state.next_vswitch_id,
                vlan,
                name: name.to_owned(),
                cancelled: false,
            };
            state.vswitches.insert(created.id, created.clone());
            Ok(created)
        }))
    }

    fn get_vswitch(&self, id: u32) -> RobotFuture<'_, VSwitch> {
        Self::respond(self.call("get_vswitch", id.to_string(), |state| {
            state
                .vswitches
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found(format!("/vswitch/{id}")))
        }))
    }

    fn list_vswitches(&self) -> RobotFuture<'_, Vec<VSwitch>> {
        Self::respond(self.call("list_vswitches", String::new(), |state| {
            Ok(state.vswitches.values().cloned().collect())
        }))
    }

    fn update_vswitch<'a>(
        &'a self,
        id: u32,
        vlan: u16,
        name: &'a str,
    ) -> RobotFuture<'a, VSwitch> {
        let detail = format!("{id} {vlan} {name}");
        Self::respond(self.call("update_vswitch", detail, |state| {
            let Some(existing) = state.vswitches.get_mut(&id) else {
                return Err(not_found(format!("/vswitch/{id}")));
            };
            existing.vlan = vlan;
            name.clone_into(&mut existing.name);
            Ok(existing.clone())
        }))
    }

    fn delete_vswitch(&self, id: u32) -> RobotFuture<'_, ()> {
        Self::respond(self.call("delete_vswitch", id.to_string(), |state| {
            state
                .vswitches
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| not_found(format!("/vswitch/{id}")))
        }))
    }

    fn list_all_servers(&self) -> RobotFuture<'_, Vec<Server>> {
        Self::respond(self.call("list_all_servers", String::new(), |state| {
            Ok(state.servers.clone())
        }))
    }
}

/// State store that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: StdMutex<BTreeMap<u32, ManagedServerState>>,
    saves: StdMutex<usize>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn records(&self) -> StdMutexGuard<'_, BTreeMap<u32, ManagedServerState>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, server_number: u32) -> Result<Option<ManagedServerState>, StateStoreError> {
        Ok(self.records().get(&server_number).cloned())
    }

    fn save(&self, state: &ManagedServerState) -> Result<(), StateStoreError> {
        self.records()
            .insert(state.declared.server_number, state.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn remove(&self, server_number: u32) -> Result<(), StateStoreError> {
        self.records().remove(&server_number);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<ManagedServerState>, StateStoreError> {
        Ok(self.records().values().cloned().collect())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
