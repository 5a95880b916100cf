//! Stateless access policy.
//!
//! A pure function of (role, subscription snapshot, user state, requested
//! resource). Callers fetch the inputs, the policy only judges them, so a
//! subscription expiring between two requests takes effect immediately.

use fabula_core::types::UserRole;

use crate::types::UserState;

/// What a caller wants to touch, reduced to the gates that matter.
#[derive(Debug, Clone, Default)]
pub struct Resource {
    pub name: String,
    pub vip_required: bool,
    pub level_required: Option<u32>,
    pub worthiness_required: Option<f64>,
    pub cost: Option<u64>,
    pub admin_only: bool,
}

impl Resource {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn admin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            admin_only: true,
            ..Default::default()
        }
    }

    pub fn vip(mut self) -> Self {
        self.vip_required = true;
        self
    }

    pub fn level(mut self, level: u32) -> Self {
        self.level_required = Some(level);
        self
    }

    pub fn worthiness(mut self, required: f64) -> Self {
        self.worthiness_required = Some(required);
        self
    }

    pub fn costing(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Denial reasons, each with enough context to build an actionable message.
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    VipRequired,
    InsufficientWorthiness { current: f64, required: f64 },
    LevelLocked { current: u32, required: u32 },
    InsufficientFunds { balance: i64, cost: u64 },
    RoleForbidden,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::VipRequired => "vip_required",
            DenyReason::InsufficientWorthiness { .. } => "insufficient_worthiness",
            DenyReason::LevelLocked { .. } => "level_locked",
            DenyReason::InsufficientFunds { .. } => "insufficient_funds",
            DenyReason::RoleForbidden => "role_forbidden",
        }
    }

    /// Actionable guidance for the user-facing layer. RoleForbidden stays
    /// deliberately generic.
    pub fn guidance(&self) -> String {
        match self {
            DenyReason::VipRequired => {
                "Este contenido es para suscriptores VIP. Usa /vip para suscribirte.".to_string()
            }
            DenyReason::InsufficientWorthiness { current, required } => format!(
                "Tu vínculo con Diana aún no alcanza ({:.2} de {:.2}). Sigue participando en el canal.",
                current, required
            ),
            DenyReason::LevelLocked { current, required } => format!(
                "Necesitas el nivel {} (tienes el {}). Completa misiones y desbloquea pistas para avanzar.",
                required, current
            ),
            DenyReason::InsufficientFunds { balance, cost } => format!(
                "Te faltan {} besitos (tienes {}).",
                (*cost as i64 - *balance).max(0),
                balance
            ),
            DenyReason::RoleForbidden => "No tienes acceso a esta función.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    Allow,
    Deny(DenyReason),
}

impl Access {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Access::Allow)
    }
}

pub struct AccessPolicy;

impl AccessPolicy {
    /// Evaluate whether a user may touch `resource`.
    ///
    /// Precedence: admin bypasses everything except nothing (the owner always
    /// has an escape hatch); then role, VIP, level, worthiness, funds, in
    /// that order so the most actionable denial wins.
    pub fn evaluate(
        role: UserRole,
        vip_active: bool,
        state: &UserState,
        resource: &Resource,
    ) -> Access {
        if role == UserRole::Admin {
            return Access::Allow;
        }

        if resource.admin_only {
            return Access::Deny(DenyReason::RoleForbidden);
        }

        if resource.vip_required && !vip_active {
            return Access::Deny(DenyReason::VipRequired);
        }

        if let Some(required) = resource.level_required {
            if state.narrative_level < required {
                return Access::Deny(DenyReason::LevelLocked {
                    current: state.narrative_level,
                    required,
                });
            }
        }

        if let Some(required) = resource.worthiness_required {
            if state.worthiness < required {
                return Access::Deny(DenyReason::InsufficientWorthiness {
                    current: state.worthiness,
                    required,
                });
            }
        }

        if let Some(cost) = resource.cost {
            if state.balance < cost as i64 {
                return Access::Deny(DenyReason::InsufficientFunds {
                    balance: state.balance,
                    cost,
                });
            }
        }

        Access::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> UserState {
        let mut s = UserState::new("u-1");
        s.balance = 5;
        s.narrative_level = 2;
        s.worthiness = 0.4;
        s
    }

    #[test]
    fn admin_bypasses_every_gate() {
        let resource = Resource::named("anything").vip().level(99).costing(1_000_000);
        let access = AccessPolicy::evaluate(UserRole::Admin, false, &state(), &resource);
        assert!(access.is_allowed());
    }

    #[test]
    fn vip_gate_follows_subscription_not_role() {
        let resource = Resource::named("vip_fragment").vip();
        // A vip role without an active subscription is still denied.
        let denied = AccessPolicy::evaluate(UserRole::Vip, false, &state(), &resource);
        assert_eq!(denied, Access::Deny(DenyReason::VipRequired));

        let allowed = AccessPolicy::evaluate(UserRole::Free, true, &state(), &resource);
        assert!(allowed.is_allowed());
    }

    #[test]
    fn level_gate_reports_both_levels() {
        let resource = Resource::named("level_4_door").level(4);
        match AccessPolicy::evaluate(UserRole::Free, false, &state(), &resource) {
            Access::Deny(DenyReason::LevelLocked { current, required }) => {
                assert_eq!(current, 2);
                assert_eq!(required, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn worthiness_gate_uses_score() {
        let resource = Resource::named("inner_circle").worthiness(0.8);
        match AccessPolicy::evaluate(UserRole::Free, false, &state(), &resource) {
            Access::Deny(DenyReason::InsufficientWorthiness { current, required }) => {
                assert!((current - 0.4).abs() < f64::EPSILON);
                assert!((required - 0.8).abs() < f64::EPSILON);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn funds_gate_reports_deficit_via_guidance() {
        let resource = Resource::named("pista").costing(12);
        match AccessPolicy::evaluate(UserRole::Free, false, &state(), &resource) {
            Access::Deny(reason @ DenyReason::InsufficientFunds { .. }) => {
                assert!(reason.guidance().contains('7')); // 12 - 5
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn admin_only_denies_without_detail() {
        let resource = Resource::admin("broadcast");
        let access = AccessPolicy::evaluate(UserRole::Vip, true, &state(), &resource);
        assert_eq!(access, Access::Deny(DenyReason::RoleForbidden));
    }
}
