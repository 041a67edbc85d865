use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the results to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn to_sink(self) -> Result<Sink, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match &self.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table(table)
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv(csv_core::Writer::new()),
        };
        Ok(Sink { args: self, io, formatter })
    }
}

/// Collects rows and renders them as a table, JSON lines or CSV.
///
/// Table output is buffered until [`Sink::finish`]; the line-oriented formats
/// stream straight through.
pub struct Sink {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Table(comfy_table::Table),
    Jsonl,
    Csv(csv_core::Writer),
}

impl Sink {
    /// Set the column names. Call before the first [`Sink::record`].
    pub fn headers(&mut self, names: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Table(table) => {
                table.set_header(names);
                Ok(())
            }
            Formatter::Jsonl => Ok(()),
            Formatter::Csv(_) => self.csv_row(&names),
        }
    }

    /// Emit one result row. Only one of the two closures runs, depending on
    /// whether the chosen format is cell-oriented or record-oriented.
    pub fn record<R: serde::Serialize>(
        &mut self,
        cells: impl FnOnce() -> Vec<String>,
        record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Table(table) => {
                table.add_row(cells());
                Ok(())
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &record()).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))
            }
            Formatter::Csv(_) => self.csv_row(&cells()),
        }
    }

    fn csv_row<V: std::ops::Deref<Target = str>>(&mut self, cells: &[V]) -> Result<(), Error> {
        let target = self.args.output.clone();
        let map_io_err = move |e| match &target {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        };
        let Formatter::Csv(writer) = &mut self.formatter else {
            unreachable!("csv_row is only reachable from the Csv formatter");
        };
        // Worst case every byte gets quoted, plus the enclosing quotes.
        let longest = cells.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut scratch = vec![0; 2 + 2 * longest];
        for cell in cells {
            let (WriteResult::InputEmpty, consumed, n) = writer.field(cell.as_bytes(), &mut scratch)
            else {
                panic!("csv scratch buffer sized too small");
            };
            debug_assert_eq!(consumed, cell.len());
            self.io.write_all(&scratch[..n]).map_err(&map_io_err)?;
            let (WriteResult::InputEmpty, n) = writer.delimiter(&mut scratch) else {
                panic!("csv scratch buffer sized too small");
            };
            self.io.write_all(&scratch[..n]).map_err(&map_io_err)?;
        }
        let (WriteResult::InputEmpty, n) = writer.terminator(&mut scratch) else {
            panic!("csv scratch buffer sized too small");
        };
        self.io.write_all(&scratch[..n]).map_err(&map_io_err)
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn finish(mut self) -> Result<(), Error> {
        if let Formatter::Table(table) = &self.formatter {
            self.io.write_fmt(format_args!("{table}\n")).map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
