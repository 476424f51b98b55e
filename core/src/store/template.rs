use super::{new_id, now_timestamp, AgingStore, TemplateRow};
use crate::{error::DunningResult, templates::TemplateData};
use rusqlite::{params, OptionalExtension};

const TEMPLATE_COLUMNS: &str = "template_id, identifier, version, data, is_active, created_at";

impl AgingStore {
    // ── Email templates (versioned) ───────────────────────────────

    pub fn active_template(&self, identifier: &str) -> DunningResult<Option<TemplateRow>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM email_template
                     WHERE identifier = ?1 AND is_active = 1"
                ),
                params![identifier],
                map_raw_template,
            )
            .optional()?;
        raw.map(RawTemplate::decode).transpose()
    }

    /// Active versions ordered by identifier. `limit = None` returns the rest.
    pub fn active_templates(
        &self,
        skip: usize,
        limit: Option<usize>,
    ) -> DunningResult<Vec<TemplateRow>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM email_template
             WHERE is_active = 1
             ORDER BY identifier ASC
             LIMIT ?1 OFFSET ?2"
        ))?;
        let raws = stmt
            .query_map(params![limit, skip as i64], map_raw_template)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawTemplate::decode).collect()
    }

    pub fn all_template_versions(&self, identifier: &str) -> DunningResult<Vec<TemplateRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM email_template
             WHERE identifier = ?1
             ORDER BY version DESC"
        ))?;
        let raws = stmt
            .query_map(params![identifier], map_raw_template)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawTemplate::decode).collect()
    }

    pub fn template_version(
        &self,
        identifier: &str,
        version: i64,
    ) -> DunningResult<Option<TemplateRow>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM email_template
                     WHERE identifier = ?1 AND version = ?2"
                ),
                params![identifier, version],
                map_raw_template,
            )
            .optional()?;
        raw.map(RawTemplate::decode).transpose()
    }

    pub fn active_template_count(&self) -> DunningResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM email_template WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn template_identifiers(&self) -> DunningResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT identifier FROM email_template ORDER BY identifier ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn template_exists(&self, identifier: &str) -> DunningResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM email_template WHERE identifier = ?1",
            params![identifier],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn next_template_version(&self, identifier: &str) -> DunningResult<i64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(version) FROM email_template WHERE identifier = ?1",
            params![identifier],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Append a new version and make it the only active one.
    pub fn insert_template_version(
        &self,
        identifier: &str,
        data: &TemplateData,
    ) -> DunningResult<TemplateRow> {
        let payload = serde_json::to_string(data)?;
        self.in_savepoint("template_version", |store| {
            let version = store.next_template_version(identifier)?;
            store.conn.execute(
                "UPDATE email_template SET is_active = 0 WHERE identifier = ?1",
                params![identifier],
            )?;
            let row = TemplateRow {
                template_id: new_id(),
                identifier: identifier.to_string(),
                version,
                data: data.clone(),
                is_active: true,
                created_at: now_timestamp(),
            };
            store.conn.execute(
                "INSERT INTO email_template (template_id, identifier, version, data, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![row.template_id, row.identifier, row.version, payload, row.created_at],
            )?;
            Ok(row)
        })
    }

    /// Make `version` the only active one. Returns false when it does not exist.
    pub fn activate_template_version(&self, identifier: &str, version: i64) -> DunningResult<bool> {
        self.in_savepoint("template_activate", |store| {
            if store.template_version(identifier, version)?.is_none() {
                return Ok(false);
            }
            store.conn.execute(
                "UPDATE email_template SET is_active = 0 WHERE identifier = ?1",
                params![identifier],
            )?;
            store.conn.execute(
                "UPDATE email_template SET is_active = 1 WHERE identifier = ?1 AND version = ?2",
                params![identifier, version],
            )?;
            Ok(true)
        })
    }

    /// Remove every version of an identifier. Returns the number of rows deleted.
    pub fn delete_templates(&self, identifier: &str) -> DunningResult<usize> {
        let n = self.conn.execute(
            "DELETE FROM email_template WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(n)
    }

    pub fn active_version_count(&self, identifier: &str) -> DunningResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM email_template WHERE identifier = ?1 AND is_active = 1",
            params![identifier],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

struct RawTemplate {
    template_id: String,
    identifier: String,
    version: i64,
    data: String,
    is_active: bool,
    created_at: String,
}

impl RawTemplate {
    fn decode(self) -> DunningResult<TemplateRow> {
        Ok(TemplateRow {
            data: serde_json::from_str(&self.data)?,
            template_id: self.template_id,
            identifier: self.identifier,
            version: self.version,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

fn map_raw_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTemplate> {
    Ok(RawTemplate {
        template_id: row.get(0)?,
        identifier: row.get(1)?,
        version: row.get(2)?,
        data: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}
