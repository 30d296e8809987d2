pub const QEMU_HOOK_DISPATCHER: &str = include_str!("../templates/hooks/qemu");
pub const START_HOOK_TEMPLATE: &str = include_str!("../templates/hooks/start.sh");
pub const REVERT_HOOK_TEMPLATE: &str = include_str!("../templates/hooks/revert.sh");
