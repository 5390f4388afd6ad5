use crate::atoms::constants::EPISODE_SCALAR_FEATURES;
use crate::atoms::error::FieldResult;
use crate::atoms::field_types::{Episode, EpisodeFeatures, Expert};
use log::warn;
use rusqlite::{params_from_iter, types::Value, Connection};

/// Column names of the 16 persisted scalars, in `EpisodeFeatures::to_scalars` order.
pub(crate) const FEATURE_COLUMNS: [&str; EPISODE_SCALAR_FEATURES] = [
    "entropy",
    "novelty",
    "arousal",
    "pulse",
    "trauma_level",
    "active_themes",
    "emerging_score",
    "fading_score",
    "reply_len_norm",
    "unique_ratio",
    "expert_temp",
    "expert_semantic",
    "recall_used",
    "misfire",
    "prompt_len_norm",
    "echo",
];

pub(crate) fn append(conn: &Connection, ep: &Episode) -> FieldResult<()> {
    let cols = FEATURE_COLUMNS.join(", ");
    let placeholders: Vec<String> = (1..=EPISODE_SCALAR_FEATURES + 6).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO episodes (id, created_at, prompt, reply, expert, quality, {cols}) VALUES ({})",
        placeholders.join(", ")
    );
    let mut values: Vec<Value> = vec![
        Value::Integer(ep.id),
        Value::Integer(ep.created_at),
        Value::Text(ep.prompt.clone()),
        Value::Text(ep.reply.clone()),
        Value::Text(ep.expert.name().to_string()),
        Value::Real(ep.quality as f64),
    ];
    values.extend(ep.features.to_scalars().iter().map(|v| Value::Real(*v as f64)));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Newest `limit` episodes, returned oldest first.
pub(crate) fn load(conn: &Connection, limit: usize) -> FieldResult<Vec<Episode>> {
    let cols = FEATURE_COLUMNS.join(", ");
    let sql = format!(
        "SELECT id, created_at, prompt, reply, expert, quality, {cols}
         FROM episodes ORDER BY id DESC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows: Vec<Episode> = stmt
        .query_map([limit as i64], |r| {
            let expert_name: String = r.get(4)?;
            let mut scalars = [0.0f32; EPISODE_SCALAR_FEATURES];
            for (i, slot) in scalars.iter_mut().enumerate() {
                *slot = r.get::<_, f64>(6 + i)? as f32;
            }
            Ok((
                Episode {
                    id: r.get(0)?,
                    created_at: r.get(1)?,
                    prompt: r.get(2)?,
                    reply: r.get(3)?,
                    features: EpisodeFeatures::from_scalars(&scalars),
                    expert: Expert::Structural,
                    quality: r.get::<_, f64>(5)? as f32,
                },
                expert_name,
            ))
        })?
        .filter_map(|row| match row {
            Ok((mut ep, name)) => match Expert::from_name(&name) {
                Some(expert) => {
                    ep.expert = expert;
                    Some(Ok(ep))
                }
                None => {
                    warn!("[episodes] Skipping episode {} with unknown expert '{}'", ep.id, name);
                    None
                }
            },
            Err(e) => Some(Err(e)),
        })
        .collect::<Result<_, _>>()?;
    rows.reverse();
    Ok(rows)
}

pub(crate) fn prune(conn: &Connection, keep: usize) -> FieldResult<usize> {
    let removed = conn.execute(
        "DELETE FROM episodes WHERE id NOT IN (SELECT id FROM episodes ORDER BY id DESC LIMIT ?1)",
        [keep as i64],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::schema::run_episode_migrations;

    fn ep(id: i64) -> Episode {
        Episode {
            id,
            created_at: 1000 + id,
            prompt: format!("prompt {id}"),
            reply: format!("reply {id}"),
            features: EpisodeFeatures { novelty: 0.5, expert_temp: 1.3, echo: 1.0, ..Default::default() },
            expert: Expert::Creative,
            quality: 0.625,
        }
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_episode_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn append_and_load_preserve_fields() {
        let conn = conn();
        append(&conn, &ep(1)).unwrap();
        let rows = load(&conn, 10).unwrap();
        assert_eq!(rows, vec![ep(1)]);
    }

    #[test]
    fn load_returns_newest_oldest_first() {
        let conn = conn();
        for i in 1..=5 {
            append(&conn, &ep(i)).unwrap();
        }
        let ids: Vec<i64> = load(&conn, 3).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn prune_keeps_newest() {
        let conn = conn();
        for i in 1..=5 {
            append(&conn, &ep(i)).unwrap();
        }
        assert_eq!(prune(&conn, 2).unwrap(), 3);
        let ids: Vec<i64> = load(&conn, 10).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }
}
