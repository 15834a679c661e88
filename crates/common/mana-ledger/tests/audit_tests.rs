mod common;

use mana_ledger::{LedgerError, LedgerResult, ManaConfig, ManaEngine, ManualClock, OwnerType};
use std::sync::Arc;
use uuid::Uuid;

fn engine(store: Arc<dyn mana_ledger::ManaStore>, now: i64) -> (ManaEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now));
    let engine = ManaEngine::new(store, clock.clone(), ManaConfig::default());
    (engine, clock)
}

#[tokio::test]
async fn transfers_in_one_bucket_accumulate() -> LedgerResult<()> {
    for (name, store) in common::stores() {
        let (engine, clock) = engine(store, 5_000_200);
        let a = engine.registry().resolve(1, OwnerType::Player).await?;
        let b = engine.registry().resolve(2, OwnerType::Player).await?;

        engine.transfers().log_transfer(a, b, 10).await?;
        clock.advance(500);
        let row = engine.transfers().log_transfer(a, b, 15).await?;
        assert_eq!(row.amount, 25, "{}", name);
        assert_eq!(row.log_time, 5_000_000, "{}", name);

        let all = engine.transfers().entries(None, None).await?;
        assert_eq!(all.len(), 1, "{}", name);
        assert_eq!(all[0].amount, 25, "{}", name);

        // Next bucket, and the reverse direction, are separate rows.
        clock.advance(1_000);
        engine.transfers().log_transfer(a, b, 1).await?;
        engine.transfers().log_transfer(b, a, 2).await?;
        assert_eq!(engine.transfers().entries(None, None).await?.len(), 3, "{}", name);
        assert_eq!(engine.transfers().entries(Some(b), None).await?.len(), 1, "{}", name);
        assert_eq!(engine.transfers().entries(Some(a), Some(b)).await?.len(), 2, "{}", name);
    }
    Ok(())
}

#[tokio::test]
async fn zero_amount_transfer_is_rejected() -> LedgerResult<()> {
    for (name, store) in common::stores() {
        let (engine, _) = engine(store, 0);
        let a = engine.registry().resolve(1, OwnerType::Player).await?;
        let b = engine.registry().resolve(2, OwnerType::Player).await?;
        let err = engine.transfers().log_transfer(a, b, 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)), "{}", name);
        assert!(engine.transfers().entries(None, None).await?.is_empty(), "{}", name);
    }
    Ok(())
}

#[tokio::test]
async fn identical_use_events_are_kept_apart() -> LedgerResult<()> {
    for (name, store) in common::stores() {
        let (engine, _) = engine(store, 42);
        let (creator, user, target) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let first = engine.uses().log_use(creator, user, target, 3, false).await?;
        let second = engine.uses().log_use(creator, user, target, 3, false).await?;
        assert_eq!(first, second, "{}", name);

        let rows = engine.uses().entries().await?;
        assert_eq!(rows.len(), 2, "{}", name);
        assert!(rows.iter().all(|r| r.amount == 3 && r.log_time == 42), "{}", name);
        assert_eq!(
            engine.interner().external_of(rows[0].pearled_target).await?,
            Some(target),
            "{}",
            name
        );
    }
    Ok(())
}

#[tokio::test]
async fn transfer_is_logged_with_the_move_or_not_at_all() -> LedgerResult<()> {
    for (name, store) in common::stores() {
        let (engine, clock) = engine(store, 5_000_200);
        let a = engine.registry().resolve(1, OwnerType::Player).await?;
        let b = engine.registry().resolve(2, OwnerType::Player).await?;
        let creator = Uuid::new_v4();
        engine.pouch(a).add_unit(5, 1, creator).await?;

        // The bucket row is already full, so logging the move must fail and undo it.
        engine.transfers().log_transfer(a, b, u64::MAX).await?;
        let err = engine.transfer_until(a, b, 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)), "{}: {:?}", name, err);
        assert_eq!(engine.pouch(a).load().await?, vec![(1, 5)], "{}", name);
        assert!(engine.pouch(b).load().await?.is_empty(), "{}", name);

        let err = engine.transfers().log_transfer(a, b, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)), "{}: {:?}", name, err);
        let rows = engine.transfers().entries(None, None).await?;
        assert_eq!(rows.len(), 1, "{}", name);
        assert_eq!(rows[0].amount, u64::MAX, "{}", name);

        // In a fresh bucket the same move goes through and lands in the log.
        clock.advance(1_000);
        let outcome = engine.transfer_until(a, b, 10).await?;
        assert_eq!(outcome.amount, 5, "{}", name);
        assert_eq!(engine.pouch(b).load().await?, vec![(1, 5)], "{}", name);
        let rows = engine.transfers().entries(Some(a), Some(b)).await?;
        assert_eq!(
            rows.iter().map(|r| (r.log_time, r.amount)).collect::<Vec<_>>(),
            vec![(5_000_000, u64::MAX), (5_001_000, 5)],
            "{}",
            name
        );
    }
    Ok(())
}
