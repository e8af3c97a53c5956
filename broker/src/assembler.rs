//! Ensamblado de resultados regionales.
//!
//! Los resultados de cada origen llegan desordenados, repetidos y desde
//! muchos workers. El ensamblador los escribe en archivos locales con
//! posiciones fijas (un valor por origen), así el orden de llegada no
//! importa, y al terminar el job los comprime y los sube al almacenamiento.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use common::{BitSet, JobId, RegionalAnalysisStatus, RegionalTemplate, RegionalWorkResult};

use crate::error::AssemblerError;
use crate::storage::{FileStorage, FileStorageKey};

/// Tope de pares origen x destino para la matriz de tiempos de viaje.
pub const MAX_ORIGIN_DESTINATION_PAIRS: usize = 1_000_000;

const ACCESS_GRID_MAGIC: &[u8; 8] = b"ACCESSGR";
const ACCESS_GRID_VERSION: i32 = 0;
const ACCESS_GRID_CHANNELS: i32 = 1;
// magic + versión, zoom, west, north, width, height, canales
const ACCESS_GRID_HEADER_LEN: u64 = 8 + 7 * 4;

const TIME_GRID_MAGIC: &[u8; 8] = b"TIMEGRID";
// magic + orígenes, destinos, percentiles
const TIME_GRID_HEADER_LEN: u64 = 8 + 3 * 4;

/// Nombre con el que se sube la grilla de accesibilidad de un percentil y cutoff.
pub fn access_grid_key(job_id: &str, percentile: u32, cutoff_minutes: u32) -> String {
    format!("{}_P{}_C{}.access", job_id, percentile, cutoff_minutes)
}

/// Nombre con el que se sube la matriz de tiempos de viaje.
pub fn travel_time_key(job_id: &str) -> String {
    format!("{}_times.grid", job_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssemblerState {
    Created,
    Accumulating,
    Finalizing,
    Uploaded,
    /// Falló la subida; los archivos locales quedan en disco.
    UploadFailed,
    /// El job se borró antes de terminar.
    Terminated,
    /// No se pudo preparar la salida.
    Errored,
}

impl AssemblerState {
    pub fn name(self) -> &'static str {
        match self {
            AssemblerState::Created => "CREATED",
            AssemblerState::Accumulating => "ACCUMULATING",
            AssemblerState::Finalizing => "FINALIZING",
            AssemblerState::Uploaded => "UPLOADED",
            AssemblerState::UploadFailed => "UPLOAD_FAILED",
            AssemblerState::Terminated => "TERMINATED",
            AssemblerState::Errored => "ERRORED",
        }
    }
}

fn io_error(path: &Path, source: io::Error) -> AssemblerError {
    AssemblerError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Archivo local con una cabecera fija seguida de valores i32 little-endian.
/// Se crea con el tamaño final, relleno de ceros.
#[derive(Debug)]
struct BufferFile {
    path: PathBuf,
    file: File,
    header_len: u64,
}

impl BufferFile {
    fn create(path: PathBuf, header: &[u8], n_values: u64) -> Result<Self, AssemblerError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        file.write_all(header).map_err(|e| io_error(&path, e))?;
        file.set_len(header.len() as u64 + n_values * 4)
            .map_err(|e| io_error(&path, e))?;
        Ok(Self {
            path,
            file,
            header_len: header.len() as u64,
        })
    }

    /// Escribe `values` seguidos a partir del valor número `index`.
    fn write_values(&mut self, index: u64, values: &[i32]) -> io::Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.file
            .seek(SeekFrom::Start(self.header_len + index * 4))?;
        self.file.write_all(&bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

/// Una salida del job. Cada variante sabe dónde va cada valor de un resultado.
#[derive(Debug)]
enum OutputWriter {
    /// Un valor por origen, para un par (percentil, cutoff).
    AccessGrid {
        percentile_index: usize,
        cutoff_index: usize,
        buffer: BufferFile,
        key: String,
    },
    /// `[origen][percentil][destino]`.
    TravelTimes {
        n_percentiles: usize,
        n_destinations: usize,
        buffer: BufferFile,
        key: String,
    },
}

impl OutputWriter {
    fn access_grid(
        dir: &Path,
        template: &RegionalTemplate,
        percentile_index: usize,
        cutoff_index: usize,
    ) -> Result<Self, AssemblerError> {
        let ext = &template.extents;
        let key = access_grid_key(
            &template.job_id,
            template.percentiles[percentile_index],
            template.cutoffs_minutes[cutoff_index],
        );

        let mut header = Vec::with_capacity(ACCESS_GRID_HEADER_LEN as usize);
        header.extend_from_slice(ACCESS_GRID_MAGIC);
        for value in [
            ACCESS_GRID_VERSION,
            ext.zoom as i32,
            ext.west as i32,
            ext.north as i32,
            ext.width as i32,
            ext.height as i32,
            ACCESS_GRID_CHANNELS,
        ] {
            header.extend_from_slice(&value.to_le_bytes());
        }

        let buffer = BufferFile::create(dir.join(&key), &header, ext.n_cells() as u64)?;
        Ok(OutputWriter::AccessGrid {
            percentile_index,
            cutoff_index,
            buffer,
            key,
        })
    }

    fn travel_times(dir: &Path, template: &RegionalTemplate) -> Result<Self, AssemblerError> {
        let n_origins = template.n_tasks_total();
        let n_destinations = template.n_destinations as usize;
        let n_percentiles = template.percentiles.len();
        let key = travel_time_key(&template.job_id);

        let mut header = Vec::with_capacity(TIME_GRID_HEADER_LEN as usize);
        header.extend_from_slice(TIME_GRID_MAGIC);
        for value in [n_origins as i32, n_destinations as i32, n_percentiles as i32] {
            header.extend_from_slice(&value.to_le_bytes());
        }

        let n_values = (n_origins * n_percentiles * n_destinations) as u64;
        let buffer = BufferFile::create(dir.join(&key), &header, n_values)?;
        Ok(OutputWriter::TravelTimes {
            n_percentiles,
            n_destinations,
            buffer,
            key,
        })
    }

    /// Los valores ya vienen validados contra el template.
    fn write(&mut self, origin: u64, result: &RegionalWorkResult) -> io::Result<()> {
        match self {
            OutputWriter::AccessGrid {
                percentile_index,
                cutoff_index,
                buffer,
                ..
            } => {
                let value = result
                    .accessibility_values
                    .as_ref()
                    .and_then(|v| v.get(*percentile_index))
                    .and_then(|row| row.get(*cutoff_index))
                    .copied()
                    .unwrap_or_default();
                buffer.write_values(origin, &[value])
            }
            OutputWriter::TravelTimes {
                n_percentiles,
                n_destinations,
                buffer,
                ..
            } => {
                let rows = result.travel_times.as_deref().unwrap_or_default();
                for (p, row) in rows.iter().enumerate() {
                    let index = (origin * *n_percentiles as u64 + p as u64) * *n_destinations as u64;
                    buffer.write_values(index, row)?;
                }
                Ok(())
            }
        }
    }

    fn buffer(&self) -> &BufferFile {
        match self {
            OutputWriter::AccessGrid { buffer, .. } | OutputWriter::TravelTimes { buffer, .. } => {
                buffer
            }
        }
    }

    fn buffer_mut(&mut self) -> &mut BufferFile {
        match self {
            OutputWriter::AccessGrid { buffer, .. } | OutputWriter::TravelTimes { buffer, .. } => {
                buffer
            }
        }
    }

    fn key(&self) -> &str {
        match self {
            OutputWriter::AccessGrid { key, .. } | OutputWriter::TravelTimes { key, .. } => key,
        }
    }
}

/// Compara las dimensiones del resultado con las del template.
fn check_dimensions(template: &RegionalTemplate, result: &RegionalWorkResult) -> Result<(), String> {
    let n_percentiles = template.percentiles.len();

    if template.record_access {
        let values = result
            .accessibility_values
            .as_ref()
            .ok_or("faltan valores de accesibilidad")?;
        if values.len() != n_percentiles {
            return Err(format!(
                "{} percentiles de accesibilidad, se esperaban {}",
                values.len(),
                n_percentiles
            ));
        }
        let n_cutoffs = template.cutoffs_minutes.len();
        if let Some(row) = values.iter().find(|row| row.len() != n_cutoffs) {
            return Err(format!("{} cutoffs, se esperaban {}", row.len(), n_cutoffs));
        }
    }

    if template.record_times {
        let times = result
            .travel_times
            .as_ref()
            .ok_or("faltan tiempos de viaje")?;
        if times.len() != n_percentiles {
            return Err(format!(
                "{} percentiles de tiempos, se esperaban {}",
                times.len(),
                n_percentiles
            ));
        }
        let n_destinations = template.n_destinations as usize;
        if let Some(row) = times.iter().find(|row| row.len() != n_destinations) {
            return Err(format!("{} destinos, se esperaban {}", row.len(), n_destinations));
        }
    }

    Ok(())
}

fn gzip(source: &Path, target: &Path) -> io::Result<()> {
    let mut input = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(File::create(target)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("borrado {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("no se pudo borrar {}: {}", path.display(), e),
    }
}

#[derive(Debug)]
struct AssemblerInner {
    state: AssemblerState,
    writers: Vec<OutputWriter>,
    origins_received: BitSet,
    n_complete: usize,
    /// Llegó al menos un resultado que no se pudo usar.
    error: bool,
}

/// Junta los resultados de un job regional en sus archivos de salida.
///
/// Cada ensamblador tiene su propio lock: escribir en disco para un job no
/// frena a los demás ni a la tabla de jobs del broker.
pub struct ResultAssembler {
    pub job_id: JobId,
    template: RegionalTemplate,
    scratch_dir: PathBuf,
    bucket: String,
    storage: Arc<dyn FileStorage>,
    inner: Mutex<AssemblerInner>,
}

impl std::fmt::Debug for ResultAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAssembler")
            .field("job_id", &self.job_id)
            .field("scratch_dir", &self.scratch_dir)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl ResultAssembler {
    pub fn new(
        template: &RegionalTemplate,
        scratch_dir: impl Into<PathBuf>,
        bucket: impl Into<String>,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        let n_total = template.n_tasks_total();
        Self {
            job_id: template.job_id.clone(),
            template: template.clone(),
            scratch_dir: scratch_dir.into(),
            bucket: bucket.into(),
            storage,
            inner: Mutex::new(AssemblerInner {
                state: AssemblerState::Created,
                writers: Vec::new(),
                origins_received: BitSet::new(n_total),
                n_complete: 0,
                error: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AssemblerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Crea los archivos de salida con sus cabeceras.
    pub fn prepare(&self) -> Result<(), AssemblerError> {
        let mut inner = self.lock();
        if inner.state != AssemblerState::Created {
            return Err(AssemblerError::InvalidState {
                operation: "prepare",
                state: inner.state.name(),
            });
        }

        if self.template.record_times {
            let origins = self.template.n_tasks_total();
            let destinations = self.template.n_destinations as usize;
            let pairs = origins.saturating_mul(destinations);
            if pairs > MAX_ORIGIN_DESTINATION_PAIRS {
                error!(
                    "job {}: {} orígenes x {} destinos supera el máximo de {} pares",
                    self.job_id, origins, destinations, MAX_ORIGIN_DESTINATION_PAIRS
                );
                inner.state = AssemblerState::Errored;
                return Err(AssemblerError::TooManyPairs {
                    origins,
                    destinations,
                    limit: MAX_ORIGIN_DESTINATION_PAIRS,
                });
            }
        }

        match self.create_writers() {
            Ok(writers) => {
                debug!("job {}: {} archivos de salida preparados", self.job_id, writers.len());
                inner.writers = writers;
                inner.state = AssemblerState::Accumulating;
                Ok(())
            }
            Err(e) => {
                error!("job {}: no se pudo preparar la salida: {}", self.job_id, e);
                inner.state = AssemblerState::Errored;
                Err(e)
            }
        }
    }

    fn create_writers(&self) -> Result<Vec<OutputWriter>, AssemblerError> {
        fs::create_dir_all(&self.scratch_dir).map_err(|e| io_error(&self.scratch_dir, e))?;

        let mut writers = Vec::new();
        if self.template.record_access {
            for p in 0..self.template.percentiles.len() {
                for c in 0..self.template.cutoffs_minutes.len() {
                    writers.push(OutputWriter::access_grid(&self.scratch_dir, &self.template, p, c)?);
                }
            }
        }
        if self.template.record_times {
            writers.push(OutputWriter::travel_times(&self.scratch_dir, &self.template)?);
        }
        Ok(writers)
    }

    /// Escribe un resultado. Un resultado malformado se loguea y marca el
    /// error del ensamblador, pero no corta el job. Vale el primer resultado
    /// válido de cada origen; devuelve `true` solo para ese.
    pub fn handle_result(&self, result: &RegionalWorkResult) -> Result<bool, AssemblerError> {
        let mut inner = self.lock();
        if inner.state != AssemblerState::Accumulating {
            return Err(AssemblerError::InvalidState {
                operation: "handle_result",
                state: inner.state.name(),
            });
        }

        let n_total = self.template.n_tasks_total();
        if result.task_id < 0 || result.task_id as u64 >= n_total as u64 {
            warn!(
                "job {}: origen {} fuera de rango (0..{}), resultado ignorado",
                self.job_id, result.task_id, n_total
            );
            inner.error = true;
            return Ok(false);
        }
        if let Some(message) = &result.error {
            warn!(
                "job {}: el worker no pudo calcular el origen {}: {}",
                self.job_id, result.task_id, message
            );
            inner.error = true;
            return Ok(false);
        }
        if let Err(mismatch) = check_dimensions(&self.template, result) {
            warn!(
                "job {}: resultado del origen {} no coincide con el template: {}",
                self.job_id, result.task_id, mismatch
            );
            inner.error = true;
            return Ok(false);
        }

        let origin = result.task_id as u64;
        if inner.origins_received.get(origin as usize) {
            debug!("job {}: origen {} repetido, se conserva el primero", self.job_id, origin);
            return Ok(false);
        }

        let mut failure = None;
        for writer in inner.writers.iter_mut() {
            if let Err(e) = writer.write(origin, result) {
                failure = Some((writer.buffer().path.clone(), e));
                break;
            }
        }
        if let Some((path, e)) = failure {
            error!("job {}: error escribiendo {}: {}", self.job_id, path.display(), e);
            inner.error = true;
            return Err(io_error(&path, e));
        }

        inner.origins_received.set(origin as usize);
        inner.n_complete += 1;
        Ok(true)
    }

    pub fn status(&self) -> RegionalAnalysisStatus {
        let inner = self.lock();
        RegionalAnalysisStatus {
            total: self.template.n_tasks_total(),
            complete: inner.n_complete,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.lock().state
    }

    pub fn has_error(&self) -> bool {
        self.lock().error
    }

    /// Archivo en construcción de la primera salida. Puede seguir creciendo
    /// mientras el job corre; no es un resultado terminado.
    pub fn buffer_file(&self) -> Option<PathBuf> {
        let inner = self.lock();
        if inner.state != AssemblerState::Accumulating {
            return None;
        }
        inner.writers.first().map(|w| w.buffer().path.clone())
    }

    /// Cierra, comprime y sube cada salida. Si la subida sale bien se borran
    /// los archivos locales; si falla quedan en disco y se loguean sus rutas.
    pub fn finish(&self) -> Result<(), AssemblerError> {
        let mut inner = self.lock();
        if inner.state != AssemblerState::Accumulating {
            return Err(AssemblerError::InvalidState {
                operation: "finish",
                state: inner.state.name(),
            });
        }
        inner.state = AssemblerState::Finalizing;

        let n_total = self.template.n_tasks_total();
        if inner.n_complete < n_total {
            warn!(
                "job {}: finalizando con {} de {} orígenes recibidos",
                self.job_id, inner.n_complete, n_total
            );
        }

        let mut uploaded = Vec::new();
        let mut failure = None;
        for writer in inner.writers.iter_mut() {
            match self.upload(writer) {
                Ok(gz_path) => uploaded.push(gz_path),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            let paths: Vec<String> = inner
                .writers
                .iter()
                .map(|w| w.buffer().path.display().to_string())
                .collect();
            error!(
                "job {}: falló la subida de resultados ({}); los archivos locales quedan en {:?}",
                self.job_id, e, paths
            );
            inner.state = AssemblerState::UploadFailed;
            return Err(e);
        }

        for writer in &inner.writers {
            remove_if_exists(&writer.buffer().path);
        }
        for gz_path in &uploaded {
            remove_if_exists(gz_path);
        }
        inner.writers.clear();
        let _ = fs::remove_dir(&self.scratch_dir);
        inner.state = AssemblerState::Uploaded;
        info!(
            "job {}: {} archivos subidos a {}",
            self.job_id,
            uploaded.len(),
            self.bucket
        );
        Ok(())
    }

    fn upload(&self, writer: &mut OutputWriter) -> Result<PathBuf, AssemblerError> {
        let buffer = writer.buffer_mut();
        buffer.flush().map_err(|e| io_error(&buffer.path, e))?;

        let mut gz_name = buffer.path.as_os_str().to_owned();
        gz_name.push(".gz");
        let gz_path = PathBuf::from(gz_name);
        gzip(&buffer.path, &gz_path).map_err(|e| io_error(&gz_path, e))?;

        let key = FileStorageKey::new(self.bucket.clone(), writer.key());
        self.storage.put(&key, &gz_path)?;
        debug!("job {}: subido {}", self.job_id, key);
        Ok(gz_path)
    }

    /// El job se borró: descarta los archivos locales sin subir nada.
    pub fn terminate(&self) {
        let mut inner = self.lock();
        match inner.state {
            AssemblerState::Uploaded | AssemblerState::Terminated | AssemblerState::UploadFailed => {
                return;
            }
            _ => {}
        }
        for writer in &inner.writers {
            remove_if_exists(&writer.buffer().path);
        }
        inner.writers.clear();
        let _ = fs::remove_dir(&self.scratch_dir);
        inner.state = AssemblerState::Terminated;
        info!("job {}: ensamblador terminado, archivos locales borrados", self.job_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::job::tests::template;
    use crate::storage::LocalFileStorage;
    use flate2::read::GzDecoder;
    use std::env;
    use std::io::Read;

    pub(crate) fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join("broker-assembler-tests").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn assembler(name: &str, tpl: &RegionalTemplate) -> (ResultAssembler, PathBuf) {
        let dir = scratch(name);
        let storage = Arc::new(LocalFileStorage::new(dir.join("store")));
        let asm = ResultAssembler::new(tpl, dir.join("scratch"), "bucket", storage);
        (asm, dir)
    }

    fn times(job: &str, task: i64, values: Vec<i32>) -> RegionalWorkResult {
        RegionalWorkResult::new(job, task).with_travel_times(vec![values])
    }

    fn gunzip(path: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn i32_at(bytes: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn el_mismo_origen_cuenta_una_sola_vez() {
        let (asm, _) = assembler("mismo_origen", &template("j1", 3, 1));
        asm.prepare().unwrap();

        assert!(asm.handle_result(&times("j1", 1, vec![10, 20])).unwrap());
        assert!(!asm.handle_result(&times("j1", 1, vec![10, 20])).unwrap());
        assert_eq!(asm.status().complete, 1);

        assert!(asm.handle_result(&times("j1", 2, vec![5, 6])).unwrap());
        assert_eq!(
            asm.status(),
            RegionalAnalysisStatus {
                total: 3,
                complete: 2
            }
        );
    }

    #[test]
    fn un_resultado_repetido_no_pisa_los_valores_del_primero() {
        let (asm, dir) = assembler("repetido_no_pisa", &template("j1", 1, 1));
        asm.prepare().unwrap();

        assert!(asm.handle_result(&times("j1", 0, vec![10, 20])).unwrap());
        assert!(!asm.handle_result(&times("j1", 0, vec![99, 99])).unwrap());
        asm.finish().unwrap();

        let grid = gunzip(&dir.join("store").join("bucket").join("j1_times.grid"));
        assert_eq!(i32_at(&grid, 20), 10);
        assert_eq!(i32_at(&grid, 24), 20);
    }

    #[test]
    fn resultado_con_dimensiones_incorrectas_no_corta_el_job() {
        let (asm, _) = assembler("dimensiones", &template("j1", 3, 1));
        asm.prepare().unwrap();

        // tres destinos cuando el template dice dos
        assert!(!asm.handle_result(&times("j1", 0, vec![1, 2, 3])).unwrap());
        assert!(asm.has_error());
        assert_eq!(asm.status().complete, 0);

        assert!(asm.handle_result(&times("j1", 1, vec![1, 2])).unwrap());
        assert_eq!(asm.status().complete, 1);
        assert_eq!(asm.state(), AssemblerState::Accumulating);
    }

    #[test]
    fn origen_fuera_de_rango_o_con_error_se_ignora() {
        let (asm, _) = assembler("fuera_de_rango", &template("j1", 2, 1));
        asm.prepare().unwrap();

        assert!(!asm.handle_result(&times("j1", 2, vec![1, 2])).unwrap());
        assert!(!asm.handle_result(&times("j1", -1, vec![1, 2])).unwrap());

        let mut failed = times("j1", 0, vec![1, 2]);
        failed.error = Some("sin red".to_string());
        assert!(!asm.handle_result(&failed).unwrap());
        assert_eq!(asm.status().complete, 0);
    }

    #[test]
    fn demasiados_pares_origen_destino_es_error_al_preparar() {
        let mut tpl = template("j1", 1000, 1000);
        tpl.n_destinations = 2;
        let (asm, _) = assembler("demasiados_pares", &tpl);

        let err = asm.prepare().unwrap_err();
        assert!(matches!(err, AssemblerError::TooManyPairs { origins: 1_000_000, .. }));
        assert_eq!(asm.state(), AssemblerState::Errored);
    }

    #[test]
    fn finish_sube_los_archivos_comprimidos_y_borra_los_locales() {
        let mut tpl = template("j1", 2, 1);
        tpl.record_access = true;
        tpl.cutoffs_minutes = vec![30, 60];
        let (asm, dir) = assembler("finish", &tpl);
        asm.prepare().unwrap();

        let buffer = asm.buffer_file().unwrap();
        assert!(buffer.ends_with("j1_P50_C30.access"));

        for task in 0..2 {
            let result = times("j1", task, vec![100 + task as i32, 200])
                .with_accessibility(vec![vec![7 * (task as i32 + 1), 9]]);
            asm.handle_result(&result).unwrap();
        }
        asm.finish().unwrap();
        assert_eq!(asm.state(), AssemblerState::Uploaded);
        assert!(!buffer.exists());

        let store = dir.join("store").join("bucket");
        let access = gunzip(&store.join("j1_P50_C30.access"));
        assert_eq!(&access[..8], b"ACCESSGR");
        assert_eq!(i32_at(&access, 8), 0);
        assert_eq!(i32_at(&access, 12), 9);
        assert_eq!(i32_at(&access, 24), 2); // width
        assert_eq!(access.len(), 36 + 2 * 4);
        assert_eq!(i32_at(&access, 36), 7);
        assert_eq!(i32_at(&access, 40), 14);

        let times_grid = gunzip(&store.join("j1_times.grid"));
        assert_eq!(&times_grid[..8], b"TIMEGRID");
        assert_eq!(i32_at(&times_grid, 8), 2);
        assert_eq!(i32_at(&times_grid, 12), 2);
        assert_eq!(i32_at(&times_grid, 16), 1);
        // origen 1, percentil 0, destino 0
        assert_eq!(i32_at(&times_grid, 20 + 2 * 4), 101);
        assert!(store.join("j1_P50_C60.access").exists());
    }

    #[test]
    fn terminate_borra_los_archivos_sin_subir() {
        let (asm, dir) = assembler("terminate", &template("j1", 2, 1));
        asm.prepare().unwrap();
        let buffer = asm.buffer_file().unwrap();
        assert!(buffer.exists());

        asm.terminate();
        assert_eq!(asm.state(), AssemblerState::Terminated);
        assert!(!buffer.exists());
        assert!(!dir.join("store").exists());
        assert!(asm.handle_result(&times("j1", 0, vec![1, 2])).is_err());
    }

    struct BrokenStorage;

    impl FileStorage for BrokenStorage {
        fn put(&self, key: &FileStorageKey, _local: &Path) -> Result<(), StorageError> {
            Err(StorageError::Io {
                path: key.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "sin conexión"),
            })
        }

        fn exists(&self, _key: &FileStorageKey) -> bool {
            false
        }

        fn get(&self, key: &FileStorageKey) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    #[test]
    fn subida_fallida_deja_los_archivos_locales() {
        let dir = scratch("subida_fallida");
        let asm = ResultAssembler::new(
            &template("j1", 1, 1),
            dir.join("scratch"),
            "bucket",
            Arc::new(BrokenStorage),
        );
        asm.prepare().unwrap();
        let buffer = asm.buffer_file().unwrap();
        asm.handle_result(&times("j1", 0, vec![1, 2])).unwrap();

        assert!(asm.finish().is_err());
        assert_eq!(asm.state(), AssemblerState::UploadFailed);
        assert!(buffer.exists());

        // un delete posterior no toca lo que quedó para el operador
        asm.terminate();
        assert!(buffer.exists());
    }
}
