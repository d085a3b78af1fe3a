//! Shared fixtures for order transaction scenarios.

use std::cell::RefCell;

use camino::Utf8PathBuf;
use hrobot::robot::Transaction;
use hrobot::test_support::FakeRobot;
use hrobot::transactions::{OrderKind, TransactionCache};
use rstest::fixture;
use tempfile::TempDir;

pub struct OrderContext {
    pub api: FakeRobot,
    pub order_id: RefCell<String>,
    pub standard: RefCell<TransactionCache>,
    pub market: TransactionCache,
    pub cache_dir: TempDir,
    pub last_read: RefCell<Option<Transaction>>,
    pub reopened: RefCell<Option<TransactionCache>>,
}

impl OrderContext {
    pub fn cache_path(&self) -> Utf8PathBuf {
        let root = Utf8PathBuf::from_path_buf(self.cache_dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non UTF-8 temp dir {}", path.display()));
        OrderKind::Standard
            .cache_path(Some(root.as_str()))
            .unwrap_or_else(|| panic!("cache path under {root}"))
    }
}

#[fixture]
pub fn order_context() -> OrderContext {
    OrderContext {
        api: FakeRobot::new(),
        order_id: RefCell::new(String::new()),
        standard: RefCell::new(TransactionCache::in_memory(OrderKind::Standard)),
        market: TransactionCache::in_memory(OrderKind::Market),
        cache_dir: TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}")),
        last_read: RefCell::new(None),
        reopened: RefCell::new(None),
    }
}
