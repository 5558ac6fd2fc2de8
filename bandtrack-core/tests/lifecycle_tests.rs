//! Suggestion and rehearsal lifecycle, annotation merge and setlists

mod helpers;

use bandtrack_core::annotations::{AnnotationUpdate, AudioChange, AudioNote};
use bandtrack_core::lifecycle::{convert_rehearsal_to_suggestion, convert_suggestion_to_rehearsal};
use bandtrack_core::performances::{create_performance, performance_setlist, NewPerformance};
use bandtrack_core::rehearsals::{
    create_rehearsal, get_rehearsal, list_rehearsals, update_rehearsal, NewRehearsal, RehearsalChanges,
    RehearsalUpdate,
};
use bandtrack_core::suggestions::{create_suggestion, get_suggestion, list_suggestions, NewSuggestion};
use bandtrack_core::{Actor, ErrorKind};

fn level(value: i64) -> RehearsalUpdate {
    RehearsalUpdate {
        annotation: AnnotationUpdate {
            level: Some(value),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn rehearsal(pool: &sqlx::SqlitePool, actor: &Actor, title: &str) -> i64 {
    create_rehearsal(
        pool,
        actor,
        &NewRehearsal {
            title: title.to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn test_conversion_round_trip_changes_identity() {
    let (_dir, pool) = helpers::file_pool().await;
    let band = helpers::band(&pool, "Band", "ana", &["ben"]).await;
    let ben = band.member(0);

    let s = create_suggestion(
        &pool,
        &ben,
        &NewSuggestion {
            title: "Superstition".to_string(),
            author: Some("Stevie Wonder".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let r = convert_suggestion_to_rehearsal(&pool, &ben, s.id).await.unwrap();
    assert_eq!(get_suggestion(&pool, &ben, s.id).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(list_suggestions(&pool, &ben).await.unwrap().is_empty());
    assert_eq!(r.author.as_deref(), Some("Stevie Wonder"));

    let back = convert_rehearsal_to_suggestion(&pool, &ben, r.id).await.unwrap();
    assert_eq!(get_rehearsal(&pool, &ben, r.id).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(back.title, "Superstition");
    assert_eq!(back.likes, 0);
    assert_eq!(back.creator_id, ben.user_id);

    // The stale id of the first conversion is unusable
    assert_eq!(
        convert_suggestion_to_rehearsal(&pool, &ben, s.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_member_annotations_are_isolated() {
    let (_dir, pool) = helpers::file_pool().await;
    let band = helpers::band(&pool, "Band", "ana", &["ben"]).await;
    let ben = band.member(0);
    let id = rehearsal(&pool, &band.admin, "Hallelujah").await;

    update_rehearsal(&pool, &band.admin, id, &level(8)).await.unwrap();
    update_rehearsal(
        &pool,
        &ben,
        id,
        &RehearsalUpdate {
            annotation: AnnotationUpdate {
                level: Some(3),
                note: Some("Bridge chords".to_string()),
                audio: Some(AudioChange::Append(AudioNote::new(" take 1 ", "data:audio/webm;base64,AAAA"))),
            },
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // A later edit by Ana touches only her own entries
    let r = update_rehearsal(&pool, &band.admin, id, &level(9)).await.unwrap();
    assert_eq!(r.annotations.levels.get(&band.admin.user_id), Some(&9));
    assert_eq!(r.annotations.levels.get(&ben.user_id), Some(&3));
    assert_eq!(r.annotations.notes.get(&ben.user_id).map(String::as_str), Some("Bridge chords"));
    assert_eq!(r.annotations.audio_notes[&ben.user_id][0].title, "take 1");
    assert_eq!(r.member_names.get(&ben.user_id).map(String::as_str), Some("ben"));
    assert_eq!(r.mean_level(), Some(6.0));
}

#[tokio::test]
async fn test_plain_member_cannot_edit_metadata_of_others() {
    let (_dir, pool) = helpers::file_pool().await;
    let band = helpers::band(&pool, "Band", "ana", &["ben"]).await;
    let ben = band.member(0);
    let id = rehearsal(&pool, &band.admin, "Wonderwall").await;

    let update = RehearsalUpdate {
        metadata: RehearsalChanges {
            title: Some("Champagne Supernova".to_string()),
            ..Default::default()
        },
        annotation: AnnotationUpdate {
            level: Some(4),
            ..Default::default()
        },
    };
    assert_eq!(
        update_rehearsal(&pool, &ben, id, &update).await.unwrap_err().kind(),
        ErrorKind::Forbidden
    );

    // Nothing from the rejected request was applied
    let r = get_rehearsal(&pool, &ben, id).await.unwrap();
    assert_eq!(r.title, "Wonderwall");
    assert!(r.annotations.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_annotation_edits_do_not_lose_updates() {
    let (_dir, pool) = helpers::file_pool().await;
    let band = helpers::band(&pool, "Band", "ana", &["ben", "cleo", "dave"]).await;
    let id = rehearsal(&pool, &band.admin, "Dancing Queen").await;

    let actors = [band.admin, band.member(0), band.member(1), band.member(2)];
    let mut handles = Vec::new();
    for (i, actor) in actors.into_iter().enumerate() {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..5 {
                update_rehearsal(&pool, &actor, id, &level(i as i64 + round))
                    .await
                    .expect("annotation update failed");
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let r = get_rehearsal(&pool, &band.admin, id).await.unwrap();
    assert_eq!(r.annotations.levels.len(), 4);
    for (i, actor) in actors.iter().enumerate() {
        assert_eq!(r.annotations.levels.get(&actor.user_id), Some(&(i as i64 + 4)));
    }
}

#[tokio::test]
async fn test_rehearsals_rank_by_mean_level() {
    let (_dir, pool) = helpers::file_pool().await;
    let band = helpers::band(&pool, "Band", "ana", &[]).await;
    let unrated = rehearsal(&pool, &band.admin, "Unrated").await;
    let weak = rehearsal(&pool, &band.admin, "Weak").await;
    let strong = rehearsal(&pool, &band.admin, "Strong").await;

    update_rehearsal(&pool, &band.admin, weak, &level(2)).await.unwrap();
    update_rehearsal(&pool, &band.admin, strong, &level(9)).await.unwrap();

    let ids: Vec<i64> = list_rehearsals(&pool, &band.admin)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![strong, weak, unrated]);
}

#[tokio::test]
async fn test_setlist_keeps_converted_rehearsal_as_missing() {
    let (_dir, pool) = helpers::file_pool().await;
    let band = helpers::band(&pool, "Band", "ana", &[]).await;
    let kept = rehearsal(&pool, &band.admin, "Kept").await;
    let moved = rehearsal(&pool, &band.admin, "Moved").await;

    let p = create_performance(
        &pool,
        &band.admin,
        &NewPerformance {
            name: "Spring Gig".to_string(),
            date: "2026-05-01".to_string(),
            location: None,
            setlist: vec![moved, kept],
        },
    )
    .await
    .unwrap();

    convert_rehearsal_to_suggestion(&pool, &band.admin, moved).await.unwrap();

    let setlist = performance_setlist(&pool, &band.admin, p.id).await.unwrap();
    assert_eq!(setlist.len(), 2);
    assert!(setlist[0].is_missing());
    assert_eq!(setlist[0].id(), moved);
    assert!(!setlist[1].is_missing());
}
