use crate::atoms::error::FieldResult;
use crate::atoms::field_types::Snapshot;
use rusqlite::{params, Connection};

pub(crate) fn load(conn: &Connection) -> FieldResult<Vec<Snapshot>> {
    let mut stmt = conn.prepare(
        "SELECT id, text, quality, emotional, created_at, last_used_at, use_count
         FROM snapshots ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Snapshot {
                id: r.get(0)?,
                text: r.get(1)?,
                quality: r.get::<_, f64>(2)? as f32,
                emotional: r.get::<_, f64>(3)? as f32,
                created_at: r.get(4)?,
                last_used_at: r.get(5)?,
                use_count: r.get::<_, i64>(6)?.max(0) as u32,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn insert(conn: &Connection, s: &Snapshot) -> FieldResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO snapshots
            (id, text, quality, emotional, created_at, last_used_at, use_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            s.id,
            s.text,
            s.quality as f64,
            s.emotional as f64,
            s.created_at,
            s.last_used_at,
            s.use_count as i64
        ],
    )?;
    Ok(())
}

pub(crate) fn touch(conn: &Connection, id: i64, last_used_at: i64, use_count: u32) -> FieldResult<()> {
    conn.execute(
        "UPDATE snapshots SET last_used_at = ?2, use_count = ?3 WHERE id = ?1",
        params![id, last_used_at, use_count as i64],
    )?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, ids: &[i64]) -> FieldResult<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM snapshots WHERE id = ?1")?;
    for id in ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::schema::run_migrations;

    fn snap(id: i64) -> Snapshot {
        Snapshot {
            id,
            text: format!("snapshot {id}"),
            quality: 0.75,
            emotional: 0.25,
            created_at: 100 + id,
            last_used_at: None,
            use_count: 0,
        }
    }

    #[test]
    fn insert_touch_delete() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert(&conn, &snap(1)).unwrap();
        insert(&conn, &snap(2)).unwrap();
        touch(&conn, 1, 500, 3).unwrap();
        delete(&conn, &[2]).unwrap();

        let rows = load(&conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_used_at, Some(500));
        assert_eq!(rows[0].use_count, 3);
        assert_eq!(rows[0].quality, 0.75);
    }
}
