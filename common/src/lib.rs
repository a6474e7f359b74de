use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

pub mod cli;
pub mod util;

pub trait EmulationCore {
    fn name(&self) -> &'static str;
    fn short_name(&self) -> &'static str;
    fn new_send(&self) -> Result<Box<dyn Instance + Send>, anyhow::Error>;

    fn new(&self) -> Result<Box<dyn Instance>, anyhow::Error> {
        Ok(self.new_send()?)
    }
    fn new_threadded(&self) -> Result<Box<dyn ThreaddedInstance>, anyhow::Error> {
        Ok(Box::new(ThreadAdapter::new(self.new_send()?)?))
    }

    /// Human readable state of a paused instance
    fn report(&self, _instance: &mut dyn Instance) -> String { String::new() }
}

#[derive(Debug, PartialEq, Eq)]
pub enum UpdateMessage {
    /// A slice of the cycle budget was consumed
    Slice { cycles: i64 },
    /// The guest stopped on its own
    Halted,
}

#[derive(Debug)]
pub enum ControlMessage {
    Pause,
}

/// Synchronous instance of an emulator core
///
/// `run` returns `Ok` when paused through `control_rx` or when the guest halts.
pub trait Instance : Send {
    fn run(&mut self,
        control_rx: &mpsc::Receiver<ControlMessage>,
        update: mpsc::SyncSender<UpdateMessage>
    ) -> Result<(), anyhow::Error>;

    fn as_any(&mut self) -> &mut dyn std::any::Any;
}

#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    Running,
    Paused,
    Error,
}

// Asynchronous instance of an emulator core
pub trait ThreaddedInstance {
    fn start(&mut self) -> Result<(), anyhow::Error>;
    fn pause(&mut self) -> Result<(), anyhow::Error>;
    fn wait_update(&mut self) -> Result<UpdateMessage, anyhow::Error>;
    fn report(&mut self, core: &dyn EmulationCore) -> String;
    fn status(&self) -> Status;
}

/// Takes a raw synchronous Instance and wraps it in a thread
///
/// The instance gets moved to the thread when running and then back to the parent thread when paused.
/// This allows the driver to have full access to the instance while paused without crossing thread
/// boundaries.
pub struct ThreadAdapter {
    instance: Option<Box<dyn Instance + Send>>,
    running: bool,
    tx_control: SyncSender<ControlMessage>,
    rx_update: Receiver<UpdateMessage>,
    tx_instance: SyncSender<Box<dyn Instance + Send>>,
    rx_instance_return: Receiver<Option<Box<dyn Instance + Send>>>,
    join: Option<std::thread::JoinHandle<Result<(), anyhow::Error>>>,
}

impl ThreadAdapter
{
    pub fn new(instance: Box<dyn Instance + Send>) -> Result<Self, anyhow::Error> {
        // Create all our channels
        let (tx_control, rx_control) = mpsc::sync_channel::<ControlMessage>(1);
        let (tx_update, rx_update) = mpsc::sync_channel::<UpdateMessage>(16);
        let (tx_instance, rx_instance) = mpsc::sync_channel::<Box<dyn Instance + Send>>(1);
        let (tx_instance_return, rx_instance_return) = mpsc::sync_channel::<Option<Box<dyn Instance + Send>>>(1);

        // Span the thread
        let join = std::thread::Builder::new()
            .name("emu-core".into())
            .spawn(move || {
                Self::thread_main(
                    rx_instance,
                    tx_instance_return,
                    rx_control,
                    tx_update)
            })?;

        Ok(Self {
            instance: Some(instance),
            running: false,
            tx_control,
            rx_update,
            tx_instance,
            rx_instance_return,
            join: Some(join),
        })
    }

    fn thread_main(
        rx_instance: Receiver<Box<dyn Instance + Send>>,
        tx_instance: SyncSender<Option<Box<dyn Instance + Send>>>,
        rx_control: Receiver<ControlMessage>,
        tx_update: SyncSender<UpdateMessage>
    ) -> Result<(), anyhow::Error> {
        // The parent hanging up on the instance channel is a normal shutdown
        while let Ok(mut instance) = rx_instance.recv() {
            let result = instance.run(&rx_control, tx_update.clone());

            // A pause that raced with the guest halting would stop the next run early
            while rx_control.try_recv().is_ok() {}

            match result {
                Ok(()) => {
                    tx_instance.send(Some(instance)).map_err(|_| anyhow::anyhow!("Channel closed"))?;
                },
                Err(e) => {
                    log::error!("Instance returned error: {:?}", e);
                    let _ = tx_instance.send(None);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl ThreaddedInstance for ThreadAdapter
{
    fn start(&mut self) -> Result<(), anyhow::Error> {
        match self.instance.take() {
            Some(instance) => {
                self.tx_instance.send(instance).map_err(|_| anyhow::anyhow!("Channel closed"))?;
                self.running = true;
                Ok(())
            }
            None => anyhow::bail!("invalid instance state"),
        }
    }
    fn pause(&mut self) -> Result<(), anyhow::Error> {
        if !self.running {
            anyhow::bail!("instance is not running");
        }
        // A full channel already holds a pause request
        let _ = self.tx_control.try_send(ControlMessage::Pause);
        // Updates nobody waits for any more would block the instance before it sees the pause
        self.instance = loop {
            while self.rx_update.try_recv().is_ok() {}
            match self.rx_instance_return.recv_timeout(Duration::from_millis(1)) {
                Ok(instance) => break instance,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => anyhow::bail!("Channel closed"),
            }
        };
        self.running = false;
        match self.instance {
            Some(_) => Ok(()),
            None => {
                match self.join.take() {
                    Some(join) => match join.join() {
                        Ok(result) => result?,
                        Err(_) => anyhow::bail!("Instance paniced"),
                    },
                    None => anyhow::bail!("invalid instance state"),
                }
                anyhow::bail!("Instance stopped")
            },
        }
    }
    fn wait_update(&mut self) -> Result<UpdateMessage, anyhow::Error> {
        Ok(self.rx_update.recv()?)
    }
    fn report(&mut self, core: &dyn EmulationCore) -> String
    {
        match self.instance {
            Some(ref mut instance) => core.report(instance.as_mut()),
            None => panic!("Instance running or paniced")
        }
    }

    fn status(&self) -> Status {
        if self.running {
            Status::Running
        } else if self.instance.is_some() {
            Status::Paused
        } else {
            Status::Error
        }
    }
}
