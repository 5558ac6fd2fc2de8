//! Lifecycle conversions between suggestions and rehearsals
//!
//! A conversion creates the successor row and deletes the source in one
//! transaction. The successor gets a new id; callers must drop any reference
//! to the old one.

use crate::access::{authorize, Actor, Role};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::rehearsals::{self, NewRehearsal, Rehearsal};
use crate::suggestions::{self, NewSuggestion, Suggestion};
use crate::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Promote a suggestion to a rehearsal; creator or moderator+
///
/// Title, author and version carry over, the media link is the video link
/// or else the generic url. The rehearsal starts unannotated and not
/// mastered. The suggestion and its votes are deleted.
pub async fn convert_suggestion_to_rehearsal(
    pool: &SqlitePool,
    actor: &Actor,
    suggestion_id: i64,
) -> Result<Rehearsal> {
    let wait = max_lock_wait_ms(pool).await;

    let rehearsal = retry_on_lock("convert suggestion", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let source = suggestions::fetch_suggestion(&mut tx, actor.group_id, suggestion_id).await?;
        access.require_manage(source.creator_id, "suggestion")?;

        let fields = NewRehearsal {
            title: source.title.clone(),
            author: source.author.clone(),
            youtube: source.media().map(str::to_string),
            spotify: None,
            version_of: source.version_of.clone(),
        };
        let id = rehearsals::insert_rehearsal(&mut tx, actor.group_id, source.creator_id, &fields).await?;

        sqlx::query("DELETE FROM suggestions WHERE id = ? AND group_id = ?")
            .bind(suggestion_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        let rehearsal = rehearsals::fetch_rehearsal(&mut tx, actor.group_id, id).await?;
        tx.commit().await?;
        Ok(rehearsal)
    })
    .await?;

    info!(
        suggestion_id,
        rehearsal_id = rehearsal.id,
        group_id = actor.group_id,
        user_id = actor.user_id,
        "Converted suggestion to rehearsal"
    );
    Ok(rehearsal)
}

/// Send a rehearsal back to the suggestion list; creator or moderator+
///
/// The new suggestion starts at zero likes. Members' levels, notes and audio
/// notes are discarded; performances referencing the rehearsal keep a
/// dangling id.
pub async fn convert_rehearsal_to_suggestion(
    pool: &SqlitePool,
    actor: &Actor,
    rehearsal_id: i64,
) -> Result<Suggestion> {
    let wait = max_lock_wait_ms(pool).await;

    let (suggestion, discarded) = retry_on_lock("convert rehearsal", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let source = rehearsals::fetch_rehearsal(&mut tx, actor.group_id, rehearsal_id).await?;
        access.require_manage(source.creator_id, "rehearsal")?;

        let fields = NewSuggestion {
            title: source.title.clone(),
            author: source.author.clone(),
            youtube: source.youtube.clone(),
            url: source.spotify.clone(),
            version_of: source.version_of.clone(),
        };
        let id = suggestions::insert_suggestion(&mut tx, actor.group_id, source.creator_id, &fields).await?;

        sqlx::query("DELETE FROM rehearsals WHERE id = ? AND group_id = ?")
            .bind(rehearsal_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        let suggestion = suggestions::fetch_suggestion(&mut tx, actor.group_id, id).await?;
        tx.commit().await?;
        Ok((suggestion, source.annotations.member_count()))
    })
    .await?;

    info!(
        rehearsal_id,
        suggestion_id = suggestion.id,
        group_id = actor.group_id,
        user_id = actor.user_id,
        discarded_annotations = discarded,
        "Converted rehearsal to suggestion"
    );
    Ok(suggestion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationUpdate;
    use crate::groups::create_group;
    use crate::identity::register_user;
    use crate::membership::join_group;
    use crate::rehearsals::{get_rehearsal, update_rehearsal, RehearsalUpdate};
    use crate::suggestions::{create_suggestion, get_suggestion};
    use crate::votes::upvote;
    use crate::Error;

    async fn setup() -> (SqlitePool, Actor, Actor) {
        let pool = crate::db::test_pool().await;
        let ana = register_user(&pool, "ana", "secret").await.unwrap();
        let ben = register_user(&pool, "ben", "secret").await.unwrap();
        let group = create_group(&pool, ana.id, "Band", None, None).await.unwrap();
        join_group(&pool, ben.id, &group.invitation_code, None).await.unwrap();
        (pool, Actor::new(ana.id, group.id), Actor::new(ben.id, group.id))
    }

    #[tokio::test]
    async fn test_suggestion_becomes_rehearsal() {
        let (pool, ana, ben) = setup().await;
        let s = create_suggestion(
            &pool,
            &ben,
            &NewSuggestion {
                title: "Valerie".to_string(),
                url: Some("https://example.org/v".to_string()),
                version_of: Some("The Zutons".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        upvote(&pool, &ana, s.id).await.unwrap();

        let r = convert_suggestion_to_rehearsal(&pool, &ana, s.id).await.unwrap();
        assert_eq!(r.title, "Valerie");
        assert_eq!(r.youtube.as_deref(), Some("https://example.org/v"));
        assert_eq!(r.version_of.as_deref(), Some("The Zutons"));
        assert_eq!(r.creator_id, ben.user_id);
        assert!(r.annotations.is_empty());
        assert!(!r.mastered);

        assert!(matches!(get_suggestion(&pool, &ana, s.id).await, Err(Error::NotFound(_))));
        let votes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM suggestion_votes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(votes, 0);

        // Source is gone: a second conversion finds nothing
        assert!(matches!(
            convert_suggestion_to_rehearsal(&pool, &ana, s.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rehearsal_back_to_suggestion_discards_annotations() {
        let (pool, ana, ben) = setup().await;
        let r = rehearsals::create_rehearsal(
            &pool,
            &ana,
            &NewRehearsal {
                title: "Creep".to_string(),
                youtube: Some("yt".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        update_rehearsal(
            &pool,
            &ben,
            r.id,
            &RehearsalUpdate {
                annotation: AnnotationUpdate {
                    level: Some(6),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let s = convert_rehearsal_to_suggestion(&pool, &ana, r.id).await.unwrap();
        assert_eq!(s.title, "Creep");
        assert_eq!(s.likes, 0);
        assert_eq!(s.media(), Some("yt"));
        assert!(matches!(get_rehearsal(&pool, &ana, r.id).await, Err(Error::NotFound(_))));

        let back = convert_suggestion_to_rehearsal(&pool, &ana, s.id).await.unwrap();
        assert!(back.annotations.is_empty());
    }

    #[tokio::test]
    async fn test_conversion_requires_manage_right() {
        let (pool, ana, ben) = setup().await;
        let s = create_suggestion(
            &pool,
            &ana,
            &NewSuggestion {
                title: "Jolene".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            convert_suggestion_to_rehearsal(&pool, &ben, s.id).await,
            Err(Error::Forbidden(_))
        ));
        assert!(get_suggestion(&pool, &ana, s.id).await.is_ok());
    }
}
