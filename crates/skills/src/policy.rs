//! Tag-based policy and sandbox gate for skill execution.
//!
//! Order of concerns: approval gate (risk tags), capability gates
//! (permission tags vs. sandbox profile), then the entrypoint allow-list
//! under the `restricted` profile.

use lmx_domain::config::{SandboxConfig, SandboxProfile};

use crate::manifest::{PermissionTag, RiskTag, SkillKind, SkillManifest};

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            requires_approval: false,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            requires_approval: false,
            reason: Some(reason),
        }
    }

    fn needs_approval() -> Self {
        Self {
            allowed: false,
            requires_approval: true,
            reason: Some("approval required".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkillsPolicy {
    profile: SandboxProfile,
    allowed_entrypoint_modules: Vec<String>,
}

impl SkillsPolicy {
    pub fn new(profile: SandboxProfile, allowed_entrypoint_modules: Vec<String>) -> Self {
        Self {
            profile,
            allowed_entrypoint_modules,
        }
    }

    pub fn from_config(sandbox: &SandboxConfig) -> Self {
        Self::new(
            sandbox.profile,
            sandbox.allowed_entrypoint_modules.clone(),
        )
    }

    pub fn profile(&self) -> SandboxProfile {
        self.profile
    }

    pub fn evaluate(&self, manifest: &SkillManifest, approved: bool) -> PolicyDecision {
        if manifest.risk_tags.contains(&RiskTag::ApprovalRequired) && !approved {
            return PolicyDecision::needs_approval();
        }

        if manifest.permission_tags.contains(&PermissionTag::ShellExec)
            && self.profile != SandboxProfile::Trusted
        {
            return PolicyDecision::deny(format!(
                "shell-exec is denied under the {:?} sandbox profile",
                self.profile
            ));
        }

        if manifest
            .permission_tags
            .contains(&PermissionTag::NetworkAccess)
            && self.profile == SandboxProfile::Strict
        {
            return PolicyDecision::deny(
                "network-access is denied under the strict sandbox profile".to_string(),
            );
        }

        if let Some(reason) = self.sandbox_block_reason(manifest) {
            return PolicyDecision::deny(reason);
        }

        PolicyDecision::allow()
    }

    /// Kind-level sandbox filter, applied independently of the tag gates.
    pub fn sandbox_block_reason(&self, manifest: &SkillManifest) -> Option<String> {
        if manifest.kind != SkillKind::Entrypoint {
            return None;
        }
        match self.profile {
            SandboxProfile::Trusted => None,
            SandboxProfile::Strict => {
                Some("entrypoint skills are denied under the strict sandbox profile".to_string())
            }
            SandboxProfile::Restricted => {
                let module = manifest.entrypoint_module().unwrap_or("");
                if self
                    .allowed_entrypoint_modules
                    .iter()
                    .any(|allowed| allowed == module)
                {
                    None
                } else {
                    Some(format!(
                        "entrypoint module '{module}' is not in the sandbox allow-list"
                    ))
                }
            }
        }
    }
}
