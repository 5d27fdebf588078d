use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Medical exam ingestion: extract, validate, normalize and store lab reports.
#[derive(Parser, Debug)]
#[command(name = "exam-ingest", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Without DATABASE_URL, keep exams in memory for this run only
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Process one document and store its exams (duplicates are detected by content)
    Ingest {
        /// Path of the document to ingest
        path: PathBuf,
        /// Patient tax identifier to attach to the extracted patient
        #[arg(long)]
        tax_id: Option<String>,
        /// File name to record instead of the one on disk
        #[arg(long)]
        name: Option<String>,
    },
    /// List stored exams of one patient, or of everyone page by page with --all
    Exams {
        /// Patient tax identifier; exams come most recent collection first
        #[arg(long, required_unless_present_any = ["all", "patient_name"])]
        tax_id: Option<String>,
        /// List every patient's exams, newest upload first
        #[arg(long, conflicts_with = "tax_id")]
        all: bool,
        /// Earliest collection date (YYYY-MM-DD)
        #[arg(long, requires = "tax_id")]
        from: Option<NaiveDate>,
        /// Latest collection date (YYYY-MM-DD)
        #[arg(long, requires = "tax_id")]
        to: Option<NaiveDate>,
        /// Only exam types whose name contains this text
        #[arg(long, requires = "tax_id")]
        exam_type: Option<String>,
        /// Only patients whose name contains this text, ignoring case
        #[arg(long, conflicts_with = "tax_id")]
        patient_name: Option<String>,
        /// Page of the listing, starting at 1
        #[arg(long, conflicts_with = "tax_id")]
        page: Option<u32>,
        /// Exams per page (at most 100)
        #[arg(long, conflicts_with = "tax_id")]
        page_size: Option<u32>,
    },
    /// Check the digits of a tax identifier
    CheckTaxId { tax_id: String },
    /// Delete a document with its exams so it can be submitted again
    Delete { document_id: Uuid },
    /// List the file formats that can be ingested
    Formats,
    /// Check that the text-generation service and the database answer
    Health,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_accepts_optional_tax_id() {
        let cli = Cli::try_parse_from(["exam-ingest", "ingest", "report.txt", "--tax-id", "529.982.247-25"])
            .unwrap();
        assert_eq!(
            cli.command,
            Command::Ingest {
                path: PathBuf::from("report.txt"),
                tax_id: Some("529.982.247-25".to_string()),
                name: None,
            }
        );
        assert!(!cli.ephemeral);
    }

    #[test]
    fn ephemeral_flag_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from(["exam-ingest", "delete", "7f9c1c2e-8a51-4a53-9a5e-4f1d2a0b6c11", "--ephemeral"])
            .unwrap();
        assert!(cli.ephemeral);
    }

    #[test]
    fn exams_lists_everyone_with_paging() {
        let cli = Cli::try_parse_from([
            "exam-ingest",
            "exams",
            "--all",
            "--patient-name",
            "silva",
            "--page",
            "2",
            "--page-size",
            "50",
        ])
        .unwrap();
        match cli.command {
            Command::Exams {
                tax_id,
                all,
                patient_name,
                page,
                page_size,
                ..
            } => {
                assert_eq!(tax_id, None);
                assert!(all);
                assert_eq!(patient_name.as_deref(), Some("silva"));
                assert_eq!(page, Some(2));
                assert_eq!(page_size, Some(50));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["exam-ingest", "exams", "--patient-name", "silva"]).is_ok());
        assert!(Cli::try_parse_from(["exam-ingest", "exams"]).is_err());
        assert!(Cli::try_parse_from(["exam-ingest", "exams", "--all", "--tax-id", "52998224725"]).is_err());
        assert!(Cli::try_parse_from(["exam-ingest", "exams", "--all", "--from", "2024-01-01"]).is_err());
    }

    #[test]
    fn exams_parses_date_bounds() {
        let cli = Cli::try_parse_from([
            "exam-ingest",
            "exams",
            "--tax-id",
            "52998224725",
            "--from",
            "2024-01-01",
            "--exam-type",
            "HDL",
        ])
        .unwrap();
        match cli.command {
            Command::Exams {
                tax_id,
                from,
                to,
                exam_type,
                ..
            } => {
                assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert_eq!(tax_id.as_deref(), Some("52998224725"));
                assert_eq!(to, None);
                assert_eq!(exam_type.as_deref(), Some("HDL"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["exam-ingest", "exams", "--tax-id", "1", "--from", "01/02/2024"]).is_err());
        assert!(Cli::try_parse_from(["exam-ingest", "delete", "not-a-uuid"]).is_err());
        assert!(Cli::try_parse_from(["exam-ingest", "check-tax-id", "52998224725"]).is_ok());
        assert!(Cli::try_parse_from(["exam-ingest", "health"]).is_ok());
    }
}
