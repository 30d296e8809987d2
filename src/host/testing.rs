//! Fake host tree for unit tests: a temp sysroot, a recording runner, and
//! an in-memory hypervisor.
use super::{Distro, DryRunRunner, Host, UnattendedPrompter};
use crate::config::Config;
use crate::libvirt::MemoryHypervisor;
use crate::paths::HostPaths;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) struct FakeHost {
    pub root: TempDir,
    pub runner: Arc<DryRunRunner>,
    pub hypervisor: Arc<MemoryHypervisor>,
    pub host: Host,
}

impl FakeHost {
    pub fn new(distro: Distro) -> Self {
        Self::with_answers(distro, Value::Object(Default::default()))
    }

    pub fn with_answers(distro: Distro, answers: Value) -> Self {
        let root = tempfile::tempdir().expect("temp sysroot");
        let runner = Arc::new(DryRunRunner::new());
        let hypervisor = Arc::new(MemoryHypervisor::new());
        let answers: BTreeMap<String, Value> =
            serde_json::from_value(answers).expect("answers object");
        let host = Host {
            paths: HostPaths::new(root.path().to_path_buf()),
            config: Config::default(),
            distro,
            runner: runner.clone(),
            hypervisor: hypervisor.clone(),
            prompter: Box::new(UnattendedPrompter::new(answers)),
        };
        let fake = Self {
            root,
            runner,
            hypervisor,
            host,
        };
        fake.write("/proc/sys/kernel/random/boot_id", "boot-1\n");
        fake
    }

    pub fn path(&self, host_path: &str) -> PathBuf {
        self.host.paths.resolve(host_path)
    }

    pub fn write(&self, host_path: &str, contents: &str) {
        let path = self.path(host_path);
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(&path, contents).expect("write fake host file");
    }

    pub fn read(&self, host_path: &str) -> String {
        fs::read_to_string(self.path(host_path)).expect("read fake host file")
    }

    pub fn mkdir(&self, host_path: &str) {
        fs::create_dir_all(self.path(host_path)).expect("create fake host dir");
    }
}
