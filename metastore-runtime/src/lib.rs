//! Runtime companions to [`metastore_client`]: continuous health probing
//! with a fall-breaker, leader discovery and acquisition, and the
//! transaction templates that keep instance records consistent.

pub mod explorer;
pub mod keys;
pub mod leader;
pub mod monitor;
pub mod operator;

pub use explorer::{
    EtcdExplorer, ExplorerHandle, ExplorerRegistry, LeaderCallback, LeaderInfo,
    StandaloneExplorer, TxnExplorer,
};
pub use leader::{ElectionApi, ElectionParams, EtcdLeader, LeadershipCallback, TxnLeader};
pub use monitor::{AlarmLevel, AlarmSink, HealthMonitor, LogAlarmSink, MonitorParams};
pub use operator::{InstanceOperator, OperateResult, OperatorError, StoreInfo, TxnStore};
