use candle_core::{Device, Tensor};
use candle_util::candle_vae_inference::TrainScores;
use flate2::read::GzDecoder;
use ndarray::prelude::*;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// A dense count matrix with optional column names
pub struct CountMatrix {
    /// rows are observations, columns are features
    pub data: Array2<f32>,
    pub columns: Option<Vec<Box<str>>>,
}

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not; `stdout` and
///   `stderr` write to the console
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    if output_file.eq_ignore_ascii_case("stderr") {
        return Ok(Box::new(BufWriter::new(std::io::stderr())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Create the parent directory of `file` if needed
///
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    if let Some(dir) = Path::new(file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

fn is_not_comment_line(line: &str) -> bool {
    !(line.starts_with('#') || line.starts_with('%'))
}

///
/// Read a whitespace-separated count matrix
///
/// * `input_file` - file name--either gzipped or not
/// * `has_header` - the first data line holds column names
///
/// Lines starting with `#` or `%` and blank lines are skipped. Every
/// row must have the same number of non-negative, finite entries.
///
pub fn read_count_matrix(input_file: &str, has_header: bool) -> anyhow::Result<CountMatrix> {
    let buf = open_buf_reader(input_file)?;

    let mut lines = vec![];
    for (lineno, line) in buf.lines().enumerate() {
        let line = line?;
        if is_not_comment_line(&line) && !line.trim().is_empty() {
            lines.push((lineno + 1, line.into_boxed_str()));
        }
    }

    let (columns, body) = if has_header {
        let (hdr, body) = lines
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("no header line in {}", input_file))?;
        let columns: Vec<Box<str>> = hdr.1.split_whitespace().map(Box::from).collect();
        (Some(columns), body)
    } else {
        (None, &lines[..])
    };

    if body.is_empty() {
        return Err(anyhow::anyhow!("no data in {}", input_file));
    }

    let rows = body
        .par_iter()
        .map(|(lineno, line)| {
            line.split_whitespace()
                .map(|w| {
                    let v = w.parse::<f32>().map_err(|e| {
                        anyhow::anyhow!("line {}: cannot parse `{}`: {}", lineno, w, e)
                    })?;
                    if !v.is_finite() || v < 0. {
                        return Err(anyhow::anyhow!(
                            "line {}: counts must be non-negative, found {}",
                            lineno,
                            v
                        ));
                    }
                    Ok(v)
                })
                .collect::<anyhow::Result<Vec<f32>>>()
        })
        .collect::<anyhow::Result<Vec<Vec<f32>>>>()?;

    let ncols = rows[0].len();
    if let Some(i) = rows.iter().position(|r| r.len() != ncols) {
        return Err(anyhow::anyhow!(
            "line {} has {} entries, expected {}",
            body[i].0,
            rows[i].len(),
            ncols
        ));
    }

    if let Some(cols) = columns.as_ref() {
        if cols.len() != ncols {
            return Err(anyhow::anyhow!(
                "{} column names for {} columns",
                cols.len(),
                ncols
            ));
        }
    }

    let nrows = rows.len();
    let data = Array2::from_shape_vec((nrows, ncols), rows.into_iter().flatten().collect())?;

    Ok(CountMatrix { data, columns })
}

///
/// Write a matrix as tab-separated lines
///
/// * `data` - matrix
/// * `columns` - optional header
/// * `output_file` - file name--either gzipped or not
///
pub fn write_matrix_tsv(
    data: &Array2<f32>,
    columns: Option<&[Box<str>]>,
    output_file: &str,
) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;

    if let Some(columns) = columns {
        writeln!(buf, "{}", columns.join("\t"))?;
    }

    for row in data.rows() {
        let line = row
            .iter()
            .map(|x| format!("{}", x))
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

///
/// Write per-epoch training scores with a header line
///
pub fn write_scores(scores: &TrainScores, output_file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    writeln!(buf, "epoch\tloss\treconstruction\tkl\telbo")?;
    let elbo = scores.elbo();
    for t in 0..scores.num_epochs() {
        writeln!(
            buf,
            "{}\t{}\t{}\t{}\t{}",
            t + 1,
            scores.loss[t],
            scores.reconstruction[t],
            scores.kl[t],
            elbo[t]
        )?;
    }
    buf.flush()?;
    Ok(())
}

/// Copy a matrix into an `n x d` tensor on `device`
pub fn array2_to_tensor(data: &Array2<f32>, device: &Device) -> candle_core::Result<Tensor> {
    let (nrows, ncols) = data.dim();
    Tensor::from_iter(data.iter().copied(), device)?.reshape((nrows, ncols))
}

/// Copy a 2d tensor back to host memory
pub fn tensor_to_array2(tensor: &Tensor) -> anyhow::Result<Array2<f32>> {
    let (nrows, ncols) = tensor.dims2()?;
    let flat = tensor
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(Array2::from_shape_vec((nrows, ncols), flat)?)
}
