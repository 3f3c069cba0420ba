//! CSV export of students and scores (RFC 4180 quoting).

use crate::schema;
use chrono::NaiveDate;
use diesel::PgConnection;
use diesel::prelude::*;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportKind {
    Students,
    Scores,
}

/// Quote a field when it contains a comma, quote, CR or LF; quotes are doubled.
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn write_row<W: Write + ?Sized>(out: &mut W, fields: &[Option<String>]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|f| f.as_deref().map(csv_field).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(b"\r\n")
}

fn header<W: Write + ?Sized>(out: &mut W, names: &[&str]) -> std::io::Result<()> {
    write_row(out, &names.iter().map(|n| Some(n.to_string())).collect::<Vec<_>>())
}

fn io_err(e: std::io::Error) -> String {
    format!("write export failed: {}", e)
}

pub fn export<W: Write + ?Sized>(conn: &mut PgConnection, kind: ExportKind, out: &mut W) -> Result<usize, String> {
    let rows = match kind {
        ExportKind::Students => export_students(conn, out)?,
        ExportKind::Scores => export_scores(conn, out)?,
    };
    out.flush().map_err(io_err)?;
    Ok(rows)
}

fn export_students<W: Write + ?Sized>(conn: &mut PgConnection, out: &mut W) -> Result<usize, String> {
    use schema::establishments::dsl as E;
    use schema::students::dsl as S;

    type Row = (
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    );
    let rows: Vec<Row> = S::students
        .left_join(E::establishments)
        .select((
            S::email,
            S::name,
            E::name.nullable(),
            S::academic_year,
            S::year_group,
            S::course,
            S::faculty,
        ))
        .order(S::email)
        .load(conn)
        .map_err(|e| format!("load students for export failed: {}", e))?;

    header(
        out,
        &["email", "name", "establishment", "academic_year", "year_group", "course", "faculty"],
    )
    .map_err(io_err)?;
    for (email, name, establishment, year, group, course, faculty) in &rows {
        write_row(
            out,
            &[
                Some(email.clone()),
                name.clone(),
                establishment.clone(),
                year.clone(),
                group.clone(),
                course.clone(),
                faculty.clone(),
            ],
        )
        .map_err(io_err)?;
    }
    Ok(rows.len())
}

fn export_scores<W: Write + ?Sized>(conn: &mut PgConnection, out: &mut W) -> Result<usize, String> {
    use schema::students::dsl as S;
    use schema::vespa_scores::dsl as V;

    type Row = (String, String, i16, [Option<i16>; 6], Option<NaiveDate>);
    let loaded: Vec<(
        String,
        String,
        i16,
        Option<i16>,
        Option<i16>,
        Option<i16>,
        Option<i16>,
        Option<i16>,
        Option<i16>,
        Option<NaiveDate>,
    )> = V::vespa_scores
        .inner_join(S::students)
        .select((
            S::email,
            V::academic_year,
            V::cycle,
            V::vision,
            V::effort,
            V::systems,
            V::practice,
            V::attitude,
            V::overall,
            V::completion_date,
        ))
        .order((S::email, V::academic_year, V::cycle))
        .load(conn)
        .map_err(|e| format!("load scores for export failed: {}", e))?;
    let rows: Vec<Row> = loaded
        .into_iter()
        .map(|(email, year, cycle, v, e, s, p, a, o, date)| (email, year, cycle, [v, e, s, p, a, o], date))
        .collect();

    header(
        out,
        &[
            "email",
            "academic_year",
            "cycle",
            "vision",
            "effort",
            "systems",
            "practice",
            "attitude",
            "overall",
            "completion_date",
        ],
    )
    .map_err(io_err)?;
    for (email, year, cycle, values, date) in &rows {
        let mut fields = vec![Some(email.clone()), Some(year.clone()), Some(cycle.to_string())];
        fields.extend(values.iter().map(|v| v.map(|v| v.to_string())));
        fields.push(date.map(|d| d.to_string()));
        write_row(out, &fields).map_err(io_err)?;
    }
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_fields_are_left_alone() {
        assert_eq!(csv_field("Year 12"), "Year 12");
        assert_eq!(csv_field(""), "");
    }

    #[test]
    fn special_characters_are_quoted() {
        assert_eq!(csv_field("Smith, Jo"), "\"Smith, Jo\"");
        assert_eq!(csv_field("the \"best\" school"), "\"the \"\"best\"\" school\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
        assert_eq!(csv_field("cr\rhere"), "\"cr\rhere\"");
    }

    #[test]
    fn rows_use_crlf_and_empty_nulls() {
        let mut out = Vec::new();
        write_row(&mut out, &[Some("a@b.org".into()), None, Some("x,y".into())]).unwrap();
        write_row(&mut out, &[Some("c@d.org".into()), Some("Lee".into()), None]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "a@b.org,,\"x,y\"\r\nc@d.org,Lee,\r\n"
        );
    }
}
