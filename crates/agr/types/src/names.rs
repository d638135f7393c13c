//! Reserved organization names.

/// Role automatically granted to the creator of a group.
pub const GROUP_MANAGER_ROLE: &str = "manager";

/// Community holding kernel-internal groups.
pub const LOCAL_COMMUNITY: &str = "local";

/// Group of the kernel's own control agents.
pub const SYSTEM_GROUP: &str = "system";

/// Role played by the kernel's control agent.
pub const KERNEL_ROLE: &str = "kernel";
