use super::{new_id, now_timestamp, AccountRow, AccountWithContacts, AgingStore, ContactRow, NewContact};
use crate::error::DunningResult;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

impl AgingStore {
    // ── Account ───────────────────────────────────────────────────

    pub fn get_account_by_client_id(&self, client_id: &str) -> DunningResult<Option<AccountRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT account_id, client_id, account_name FROM account WHERE client_id = ?1",
                params![client_id],
                map_account_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Create an account together with its primary contact.
    /// Both rows land or neither does.
    pub fn create_account_with_contact(
        &self,
        client_id: &str,
        account_name: &str,
        contact: &NewContact,
    ) -> DunningResult<(AccountRow, ContactRow)> {
        self.in_savepoint("create_account", |store| {
            let now = now_timestamp();
            let account = AccountRow {
                account_id: new_id(),
                client_id: client_id.to_string(),
                account_name: account_name.to_string(),
            };
            store.conn.execute(
                "INSERT INTO account (account_id, client_id, account_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![account.account_id, account.client_id, account.account_name, now],
            )?;

            let contact = ContactRow {
                contact_id: new_id(),
                account_id: account.account_id.clone(),
                first_name: contact.first_name.clone(),
                last_name: contact.last_name.clone(),
                email: contact.email.clone(),
                phone: contact.phone.clone(),
                is_billing_contact: contact.is_billing_contact,
            };
            store.insert_contact_row(&contact, &now)?;
            Ok((account, contact))
        })
    }

    pub fn add_contact(&self, account_id: &str, contact: &NewContact) -> DunningResult<ContactRow> {
        let row = ContactRow {
            contact_id: new_id(),
            account_id: account_id.to_string(),
            first_name: contact.first_name.clone(),
            last_name: contact.last_name.clone(),
            email: contact.email.clone(),
            phone: contact.phone.clone(),
            is_billing_contact: contact.is_billing_contact,
        };
        self.insert_contact_row(&row, &now_timestamp())?;
        Ok(row)
    }

    fn insert_contact_row(&self, c: &ContactRow, now: &str) -> DunningResult<()> {
        self.conn.execute(
            "INSERT INTO contact (contact_id, account_id, first_name, last_name, email, phone,
                                  is_billing_contact, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                c.contact_id,
                c.account_id,
                c.first_name,
                c.last_name,
                c.email,
                c.phone,
                if c.is_billing_contact { 1i64 } else { 0i64 },
                now,
            ],
        )?;
        Ok(())
    }

    pub fn contacts_for_account(&self, account_id: &str) -> DunningResult<Vec<ContactRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT contact_id, account_id, first_name, last_name, email, phone, is_billing_contact
             FROM contact WHERE account_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![account_id], map_contact_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Batch lookup of accounts with their contacts. Output follows the order
    /// of `account_ids`; unknown ids are skipped.
    pub fn accounts_with_contacts(
        &self,
        account_ids: &[String],
    ) -> DunningResult<Vec<AccountWithContacts>> {
        if account_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; account_ids.len()].join(",");

        let mut stmt = self.conn.prepare(&format!(
            "SELECT account_id, client_id, account_name FROM account
             WHERE account_id IN ({placeholders})"
        ))?;
        let mut accounts: HashMap<String, AccountRow> = stmt
            .query_map(rusqlite::params_from_iter(account_ids.iter()), map_account_row)?
            .map(|r| r.map(|a| (a.account_id.clone(), a)))
            .collect::<Result<_, _>>()?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT contact_id, account_id, first_name, last_name, email, phone, is_billing_contact
             FROM contact WHERE account_id IN ({placeholders})
             ORDER BY rowid ASC"
        ))?;
        let mut contacts: HashMap<String, Vec<ContactRow>> = HashMap::new();
        for contact in stmt.query_map(rusqlite::params_from_iter(account_ids.iter()), map_contact_row)? {
            let contact = contact?;
            contacts.entry(contact.account_id.clone()).or_default().push(contact);
        }

        Ok(account_ids
            .iter()
            .filter_map(|id| {
                accounts.remove(id).map(|account| AccountWithContacts {
                    contacts: contacts.remove(id).unwrap_or_default(),
                    account,
                })
            })
            .collect())
    }

    pub fn account_count(&self) -> DunningResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM account", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn contact_count(&self) -> DunningResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM contact", [], |row| row.get(0))?;
        Ok(n)
    }
}

fn map_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        account_id: row.get(0)?,
        client_id: row.get(1)?,
        account_name: row.get(2)?,
    })
}

fn map_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok(ContactRow {
        contact_id: row.get(0)?,
        account_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        email: row.get(4)?,
        phone: row.get(5)?,
        is_billing_contact: row.get::<_, i64>(6)? != 0,
    })
}
