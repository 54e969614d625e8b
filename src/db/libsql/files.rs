//! Case files and documents.

use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{
    CaseFileFilter, CaseFileRecord, CaseFileStatus, CaseFileStore, CreateCaseFileParams,
    CreateDocumentParams, DocumentFilter, DocumentRecord, DocumentStore, Paged,
    UpdateCaseFileParams, UpdateDocumentParams, Visibility,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, QueryArgs, bool_value, count_rows, fmt_ts, get_bool, get_i64, get_opt_text,
    get_text, like_pattern, matter_scope, opt_date, opt_text, opt_text_owned, opt_uuid,
    parse_date_opt, parse_ts, parse_uuid, parse_uuid_opt,
};

const CASE_FILE_COLUMNS: &str = "c.id, c.matter_id, c.title, c.case_number, c.court, c.case_type, \
     c.status, c.filed_on, c.next_hearing_on, c.description, c.created_by, c.created_at, c.updated_at";

const DOCUMENT_COLUMNS: &str = "d.id, d.matter_id, d.case_file_id, d.title, d.file_name, \
     d.stored_path, d.content_type, d.size_bytes, d.client_visible, d.uploaded_by, d.created_at, \
     d.updated_at";

fn parse_case_file_status(raw: &str) -> Result<CaseFileStatus, DatabaseError> {
    CaseFileStatus::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid case file status '{}'", raw)))
}

fn row_to_case_file_record(row: &libsql::Row) -> Result<CaseFileRecord, DatabaseError> {
    Ok(CaseFileRecord {
        id: parse_uuid(&get_text(row, 0), "case_file.id")?,
        matter_id: parse_uuid(&get_text(row, 1), "case_file.matter_id")?,
        title: get_text(row, 2),
        case_number: get_opt_text(row, 3),
        court: get_opt_text(row, 4),
        case_type: get_opt_text(row, 5),
        status: parse_case_file_status(&get_text(row, 6))?,
        filed_on: parse_date_opt(get_opt_text(row, 7))?,
        next_hearing_on: parse_date_opt(get_opt_text(row, 8))?,
        description: get_opt_text(row, 9),
        created_by: parse_uuid_opt(get_opt_text(row, 10), "case_file.created_by")?,
        created_at: parse_ts(&get_text(row, 11))?,
        updated_at: parse_ts(&get_text(row, 12))?,
    })
}

fn row_to_document_record(row: &libsql::Row) -> Result<DocumentRecord, DatabaseError> {
    Ok(DocumentRecord {
        id: parse_uuid(&get_text(row, 0), "document.id")?,
        matter_id: parse_uuid(&get_text(row, 1), "document.matter_id")?,
        case_file_id: parse_uuid_opt(get_opt_text(row, 2), "document.case_file_id")?,
        title: get_text(row, 3),
        file_name: get_text(row, 4),
        stored_path: get_text(row, 5),
        content_type: get_text(row, 6),
        size_bytes: get_i64(row, 7),
        client_visible: get_bool(row, 8),
        uploaded_by: parse_uuid_opt(get_opt_text(row, 9), "document.uploaded_by")?,
        created_at: parse_ts(&get_text(row, 10))?,
        updated_at: parse_ts(&get_text(row, 11))?,
    })
}

fn document_scope(args: &mut QueryArgs, visibility: Visibility) {
    matter_scope(args, visibility, "d.matter_id");
    if matches!(visibility, Visibility::Client(_)) {
        args.clause("d.client_visible = 1".to_string());
    }
}

#[async_trait::async_trait]
impl CaseFileStore for LibSqlBackend {
    async fn create_case_file(
        &self,
        input: &CreateCaseFileParams,
    ) -> Result<CaseFileRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO case_files (id, matter_id, title, case_number, court, case_type, status, \
             filed_on, next_hearing_on, description, created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                id.to_string(),
                input.matter_id.to_string(),
                input.title.as_str(),
                opt_text(input.case_number.as_deref()),
                opt_text(input.court.as_deref()),
                opt_text(input.case_type.as_deref()),
                input.status.as_str(),
                opt_date(input.filed_on),
                opt_date(input.next_hearing_on),
                opt_text(input.description.as_deref()),
                input.created_by.to_string(),
                now,
            ],
        )
        .await?;

        self.get_case_file(id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created case file".to_string()))
    }

    async fn get_case_file(&self, id: Uuid) -> Result<Option<CaseFileRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {CASE_FILE_COLUMNS} FROM case_files c WHERE c.id = ?1 LIMIT 1"),
                params![id.to_string()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_case_file_record(&row)).transpose()
    }

    async fn list_case_files(
        &self,
        filter: &CaseFileFilter,
    ) -> Result<Paged<CaseFileRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        matter_scope(&mut args, filter.visibility, "c.matter_id");
        if let Some(matter_id) = filter.matter_id {
            let p = args.text(matter_id.to_string());
            args.clause(format!("c.matter_id = {p}"));
        }
        if let Some(status) = filter.status {
            let p = args.text(status.as_str());
            args.clause(format!("c.status = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.text(like_pattern(search));
            args.clause(format!(
                "(LOWER(c.title) LIKE {p} ESCAPE '\\' OR LOWER(COALESCE(c.case_number, '')) LIKE {p} ESCAPE '\\')"
            ));
        }

        let total = count_rows(&conn, "case_files c", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CASE_FILE_COLUMNS} FROM case_files c{where_sql} \
                     ORDER BY c.created_at DESC, c.id ASC{page_sql}"
                ),
                args.params(),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_case_file_record(&row)?);
        }
        Ok(Paged { items, total })
    }

    async fn update_case_file(
        &self,
        id: Uuid,
        input: &UpdateCaseFileParams,
    ) -> Result<Option<CaseFileRecord>, DatabaseError> {
        let Some(existing) = self.get_case_file(id).await? else {
            return Ok(None);
        };

        let title = input.title.clone().unwrap_or(existing.title);
        let case_number = input.case_number.clone().unwrap_or(existing.case_number);
        let court = input.court.clone().unwrap_or(existing.court);
        let case_type = input.case_type.clone().unwrap_or(existing.case_type);
        let status = input.status.unwrap_or(existing.status);
        let filed_on = input.filed_on.unwrap_or(existing.filed_on);
        let next_hearing_on = input.next_hearing_on.unwrap_or(existing.next_hearing_on);
        let description = input.description.clone().unwrap_or(existing.description);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE case_files SET title = ?2, case_number = ?3, court = ?4, case_type = ?5, \
             status = ?6, filed_on = ?7, next_hearing_on = ?8, description = ?9, updated_at = ?10 \
             WHERE id = ?1",
            params![
                id.to_string(),
                title,
                opt_text_owned(case_number),
                opt_text_owned(court),
                opt_text_owned(case_type),
                status.as_str(),
                opt_date(filed_on),
                opt_date(next_hearing_on),
                opt_text_owned(description),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.get_case_file(id).await
    }

    async fn delete_case_file(&self, id: Uuid) -> Result<bool, DatabaseError> {
        // Documents and tasks keep their rows; the FK sets case_file_id to NULL.
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM case_files WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }
}

#[async_trait::async_trait]
impl DocumentStore for LibSqlBackend {
    async fn create_document(
        &self,
        input: &CreateDocumentParams,
    ) -> Result<DocumentRecord, DatabaseError> {
        let conn = self.connect().await?;
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO documents (id, matter_id, case_file_id, title, file_name, stored_path, \
             content_type, size_bytes, client_visible, uploaded_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                input.id.to_string(),
                input.matter_id.to_string(),
                opt_uuid(input.case_file_id),
                input.title.as_str(),
                input.file_name.as_str(),
                input.stored_path.as_str(),
                input.content_type.as_str(),
                input.size_bytes,
                bool_value(input.client_visible),
                input.uploaded_by.to_string(),
                now,
            ],
        )
        .await?;

        self.get_document(input.id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created document".to_string()))
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE d.id = ?1 LIMIT 1"),
                params![id.to_string()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_document_record(&row)).transpose()
    }

    async fn list_documents(
        &self,
        filter: &DocumentFilter,
    ) -> Result<Paged<DocumentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        document_scope(&mut args, filter.visibility);
        if let Some(matter_id) = filter.matter_id {
            let p = args.text(matter_id.to_string());
            args.clause(format!("d.matter_id = {p}"));
        }
        if let Some(case_file_id) = filter.case_file_id {
            let p = args.text(case_file_id.to_string());
            args.clause(format!("d.case_file_id = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.text(like_pattern(search));
            args.clause(format!(
                "(LOWER(d.title) LIKE {p} ESCAPE '\\' OR LOWER(d.file_name) LIKE {p} ESCAPE '\\')"
            ));
        }

        let total = count_rows(&conn, "documents d", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents d{where_sql} \
                     ORDER BY d.created_at DESC, d.id ASC{page_sql}"
                ),
                args.params(),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_document_record(&row)?);
        }
        Ok(Paged { items, total })
    }

    async fn update_document(
        &self,
        id: Uuid,
        input: &UpdateDocumentParams,
    ) -> Result<Option<DocumentRecord>, DatabaseError> {
        let Some(existing) = self.get_document(id).await? else {
            return Ok(None);
        };

        let title = input.title.clone().unwrap_or(existing.title);
        let case_file_id = input.case_file_id.unwrap_or(existing.case_file_id);
        let client_visible = input.client_visible.unwrap_or(existing.client_visible);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE documents SET title = ?2, case_file_id = ?3, client_visible = ?4, updated_at = ?5 \
             WHERE id = ?1",
            params![
                id.to_string(),
                title,
                opt_uuid(case_file_id),
                bool_value(client_visible),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.get_document(id).await
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    async fn document_paths_for_matter(
        &self,
        matter_id: Uuid,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT stored_path FROM documents WHERE matter_id = ?1",
                params![matter_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(get_text(&row, 0));
        }
        Ok(out)
    }
}
