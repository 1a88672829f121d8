use core::str::FromStr;

use serde::{Deserialize, Serialize};

use kermesse_core::{LedgerError, LedgerResult, StandId, UserId};

use crate::transaction::Party;

/// Account role, resolved by the (external) identity subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Parent,
    StandHolder,
    Organizer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Parent => "parent",
            Role::StandHolder => "stand_holder",
            Role::Organizer => "organizer",
        }
    }

    /// Only students and parents hold tokens.
    pub fn carries_balance(self) -> bool {
        matches!(self, Role::Student | Role::Parent)
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "parent" => Ok(Role::Parent),
            "stand_holder" => Ok(Role::StandHolder),
            "organizer" => Ok(Role::Organizer),
            other => Err(LedgerError::InvalidUserRole(other.to_string())),
        }
    }
}

/// Role-specific data the ledger reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Profile {
    Student {
        tokens: i64,
        points: i64,
        /// `None` until a parent links the student.
        parent_id: Option<UserId>,
    },
    Parent {
        tokens: i64,
    },
    StandHolder {
        stand_id: Option<StandId>,
    },
    Organizer,
}

/// A user account as seen by the ledger.
///
/// Profile CRUD belongs to the identity subsystem; the ledger only touches
/// `tokens` and `points`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub name: String,
    pub profile: Profile,
}

impl Account {
    pub fn student(user_id: UserId, name: impl Into<String>, parent_id: Option<UserId>) -> Self {
        Self {
            user_id,
            name: name.into(),
            profile: Profile::Student {
                tokens: 0,
                points: 0,
                parent_id,
            },
        }
    }

    pub fn parent(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            profile: Profile::Parent { tokens: 0 },
        }
    }

    pub fn stand_holder(user_id: UserId, name: impl Into<String>, stand_id: Option<StandId>) -> Self {
        Self {
            user_id,
            name: name.into(),
            profile: Profile::StandHolder { stand_id },
        }
    }

    pub fn organizer(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            profile: Profile::Organizer,
        }
    }

    /// Opening balance for seeded accounts. Ignored for roles without a balance.
    pub fn with_tokens(mut self, opening: i64) -> Self {
        match &mut self.profile {
            Profile::Student { tokens, .. } | Profile::Parent { tokens } => *tokens = opening.max(0),
            Profile::StandHolder { .. } | Profile::Organizer => {}
        }
        self
    }

    pub fn role(&self) -> Role {
        match self.profile {
            Profile::Student { .. } => Role::Student,
            Profile::Parent { .. } => Role::Parent,
            Profile::StandHolder { .. } => Role::StandHolder,
            Profile::Organizer => Role::Organizer,
        }
    }

    /// Current token balance; fails for roles without one.
    pub fn tokens(&self) -> LedgerResult<i64> {
        match self.profile {
            Profile::Student { tokens, .. } | Profile::Parent { tokens } => Ok(tokens),
            _ => Err(LedgerError::InvalidUserRole(self.role().to_string())),
        }
    }

    pub fn points(&self) -> LedgerResult<i64> {
        match self.profile {
            Profile::Student { points, .. } => Ok(points),
            _ => Err(LedgerError::InvalidUserRole(self.role().to_string())),
        }
    }

    pub fn parent_id(&self) -> Option<UserId> {
        match self.profile {
            Profile::Student { parent_id, .. } => parent_id,
            _ => None,
        }
    }

    pub fn stand_id(&self) -> Option<StandId> {
        match self.profile {
            Profile::StandHolder { stand_id } => stand_id,
            _ => None,
        }
    }

    /// Ledger party for this account. Only balance-carrying roles move tokens.
    pub fn as_party(&self) -> LedgerResult<Party> {
        match self.profile {
            Profile::Student { .. } => Ok(Party::Student(self.user_id)),
            Profile::Parent { .. } => Ok(Party::Parent(self.user_id)),
            _ => Err(LedgerError::InvalidUserRole(self.role().to_string())),
        }
    }

    /// Apply a signed delta to the token balance and return the new balance.
    ///
    /// A delta that would leave the balance negative fails and leaves the
    /// account untouched.
    pub fn adjust_tokens(&mut self, delta: i64) -> LedgerResult<i64> {
        let role = self.role();
        let tokens = match &mut self.profile {
            Profile::Student { tokens, .. } | Profile::Parent { tokens } => tokens,
            _ => return Err(LedgerError::InvalidUserRole(role.to_string())),
        };

        let next = tokens
            .checked_add(delta)
            .ok_or_else(|| LedgerError::invalid_transaction("token balance overflow"))?;
        if next < 0 {
            let required = delta
                .checked_neg()
                .ok_or_else(|| LedgerError::invalid_transaction("token debit out of range"))?;
            return Err(LedgerError::InsufficientTokens {
                available: *tokens,
                required,
            });
        }

        *tokens = next;
        Ok(next)
    }

    /// Add activity points to a student and return the new total.
    pub fn add_points(&mut self, added: i64) -> LedgerResult<i64> {
        if added <= 0 {
            return Err(LedgerError::invalid_transaction("points must be positive"));
        }
        let role = self.role();
        match &mut self.profile {
            Profile::Student { points, .. } => {
                *points = points
                    .checked_add(added)
                    .ok_or_else(|| LedgerError::invalid_transaction("points overflow"))?;
                Ok(*points)
            }
            _ => Err(LedgerError::InvalidUserRole(role.to_string())),
        }
    }
}
