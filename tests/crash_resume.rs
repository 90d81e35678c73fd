mod common;

use flotilla_core::checkpoints::{CheckpointSnapshot, CheckpointTrigger, SortieSnapshot, SortieStatus};
use flotilla_core::events::{EventPayload, EventType};
use flotilla_core::ids::{MailboxId, MissionId};
use flotilla_core::{Clock, ManualClock};
use flotilla_engine::{ResumeOptions, ResumeTarget};

fn three_pending() -> CheckpointSnapshot {
    CheckpointSnapshot {
        progress_percent: 50.0,
        sorties: vec![
            SortieSnapshot::new("s-1", SortieStatus::Pending),
            SortieSnapshot::new("s-2", SortieStatus::Pending),
            SortieSnapshot::new("s-3", SortieStatus::Pending),
        ],
        created_by: "coordinator".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn msn_1_resumes_once_after_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let mission = MissionId::from_raw("msn-1");

    let created = {
        let before = common::harness(dir.path(), clock.clone());
        let write = before
            .coordinator
            .create_checkpoint(&mission, CheckpointTrigger::Error, three_pending())
            .unwrap();
        assert!(!write.degraded);
        write.checkpoint
        // Dropped here: the process "crashes" with nothing but the store left.
    };

    clock.advance_ms(30_000);
    let after = common::harness(dir.path(), clock.clone());

    let latest = after.coordinator.get_latest_checkpoint(&mission).unwrap();
    assert_eq!(latest.id, created.id);
    assert_eq!(latest.progress_percent, 50.0);
    assert!(latest.consumed_at.is_none());

    let target = ResumeTarget::Checkpoint(latest.id.clone());
    let report = after
        .coordinator
        .resume_checkpoint(&target, ResumeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.plan.tasks_to_resume.len(), 3);
    assert_eq!(report.requeued_seqs.len(), 3);
    assert_eq!(report.consumed_at, Some(clock.now()));
    assert_eq!(report.plan.environment.since_checkpoint_ms, 30_000);

    let consumed = after.coordinator.get_checkpoint(&latest.id).unwrap();
    assert_eq!(consumed.consumed_at, Some(clock.now()));

    let requeued: Vec<String> = after
        .coordinator
        .get_events(&MailboxId::for_mission(&mission), None)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type() == EventType::SortieRequeued)
        .map(|e| match e.payload {
            EventPayload::SortieRequeued { sortie_id, .. } => sortie_id.to_string(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(requeued, vec!["s-1", "s-2", "s-3"]);

    let err = after
        .coordinator
        .resume_checkpoint(&target, ResumeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_kind(), "already_consumed");
}

#[tokio::test]
async fn file_backup_covers_a_lost_primary_row() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let mission = MissionId::from_raw("msn-1");

    let h = common::harness(dir.path(), clock.clone());
    let created = h
        .coordinator
        .create_checkpoint(&mission, CheckpointTrigger::Manual, three_pending())
        .unwrap()
        .checkpoint;
    drop(h);

    // The primary loses its copy; the file backend still has one.
    let db = flotilla_store::Database::open(&dir.path().join("flotilla.db")).unwrap();
    db.with_conn(|conn| {
        conn.execute("DELETE FROM checkpoints WHERE id = ?1", [created.id.as_str()])?;
        Ok(())
    })
    .unwrap();
    drop(db);

    let after = common::harness(dir.path(), clock.clone());
    let latest = after.coordinator.get_latest_checkpoint(&mission).unwrap();
    assert_eq!(latest.id, created.id);
    assert_eq!(latest.unfinished_sorties().count(), 3);
}
