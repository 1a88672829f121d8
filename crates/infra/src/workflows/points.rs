//! Activity stands award points to students.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use kermesse_core::{Denial, KermesseId, LedgerError, LedgerResult, StandId, UserId};
use kermesse_ledger::{LedgerEvent, PointAttributionResult, PointsAttributed};

use crate::store::UnitOfWork;

use super::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointAttributionWorkflow {
    pub stand_holder_id: UserId,
    pub kermesse_id: KermesseId,
    pub stand_id: StandId,
    pub student_id: UserId,
    pub points: i64,
}

#[async_trait]
impl Workflow for PointAttributionWorkflow {
    type Output = PointAttributionResult;

    fn name(&self) -> &'static str {
        "attribute_points"
    }

    async fn run(&self, uow: &mut dyn UnitOfWork, _now: DateTime<Utc>) -> LedgerResult<PointAttributionResult> {
        if self.points <= 0 {
            return Err(LedgerError::invalid_transaction("points must be positive"));
        }

        if !uow.is_stand_holder(self.stand_holder_id, self.stand_id).await? {
            debug!(user_id = %self.stand_holder_id, stand_id = %self.stand_id, "caller does not hold the stand");
            return Err(LedgerError::PermissionDenied(Denial::NotStandHolder));
        }

        let stand = uow.stand(self.stand_id).await?;
        stand.ensure_in(self.kermesse_id)?;
        stand.ensure_activity()?;

        if !uow.is_participant(self.kermesse_id, self.student_id).await? {
            debug!(student_id = %self.student_id, kermesse_id = %self.kermesse_id, "student is not a participant");
            return Err(LedgerError::PermissionDenied(Denial::NotParticipant));
        }

        let total_points = uow.add_points(self.student_id, self.points).await?;
        uow.record_points_given(self.stand_id, self.points).await?;

        Ok(PointAttributionResult {
            student_id: self.student_id,
            points_added: self.points,
            total_points,
        })
    }

    fn events(&self, output: &PointAttributionResult, committed_at: DateTime<Utc>) -> Vec<LedgerEvent> {
        vec![LedgerEvent::PointsAttributed(PointsAttributed {
            kermesse_id: self.kermesse_id,
            stand_id: self.stand_id,
            student_id: output.student_id,
            points: output.points_added,
            total_points: output.total_points,
            occurred_at: committed_at,
        })]
    }
}
